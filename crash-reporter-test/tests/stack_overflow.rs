use crash_reporter_test::*;

#[test]
fn stack_overflow_simple() {
    run_test(Signal::StackOverflow, false);
}

#[test]
fn stack_overflow_threaded() {
    run_threaded_test(Signal::StackOverflow, 8);
}
