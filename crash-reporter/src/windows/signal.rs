//! Windows doesn't have an exception for process aborts, so we hook `SIGABRT`

/// Installs our `SIGABRT` handler
///
/// # Safety
///
/// Performs syscalls
pub(super) unsafe fn install_abort_handler() -> Result<(), std::io::Error> {
    // It would be nice to use sigaction here since it's better, but it isn't
    // supported on Windows :p
    unsafe {
        let old_handler = libc::signal(libc::SIGABRT, signal_handler as usize);
        if old_handler != usize::MAX {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

unsafe extern "C" fn signal_handler(_signal: i32, _subcode: i32) {
    // https://github.com/chromium/crashpad/blob/fca8871ca3fb721d3afab370ca790122f9333bfd/client/crashpad_client_win.cc#L197
    //
    // Once this returns the CRT terminates the process
    unsafe { super::state::simulate_exception(crate::codes::ABORT as i32) };
}
