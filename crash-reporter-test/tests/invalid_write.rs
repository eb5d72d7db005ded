use crash_reporter_test::*;

#[test]
fn invalid_write_reports_address() {
    let run = run_test(Signal::InvalidWrite, false);

    let log = run.log();
    let reason = log
        .lines()
        .find_map(|line| line.strip_prefix("Reason: "))
        .expect("no reason in log");
    assert_eq!(reason, INVALID_WRITE_REASON);
}

#[test]
fn invalid_write_threaded() {
    run_threaded_test(Signal::InvalidWrite, 8);
}
