// Integer division by zero doesn't trap on arm
#![cfg(any(target_arch = "x86_64", target_arch = "x86"))]

use crash_reporter_test::*;

#[test]
fn fpe_simple() {
    run_test(Signal::Fpe, false);
}

#[test]
fn fpe_threaded() {
    run_threaded_test(Signal::Fpe, 8);
}
