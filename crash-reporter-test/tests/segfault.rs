use crash_reporter_test::*;

#[test]
fn segfault_simple() {
    run_test(Signal::Segv, false);
}

#[test]
fn segfault_threaded() {
    run_threaded_test(Signal::Segv, 8);
}
