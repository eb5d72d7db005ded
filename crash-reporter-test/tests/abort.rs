use crash_reporter_test::*;

#[test]
fn abort_simple() {
    run_test(Signal::Abort, false);
}

#[test]
fn abort_threaded() {
    run_threaded_test(Signal::Abort, 8);
}
