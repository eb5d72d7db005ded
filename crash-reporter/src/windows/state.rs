#![allow(non_camel_case_types)]

use super::ExceptionCapture;
use crate::{CrashReporter, Disposition, Error};
use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

type LPTOP_LEVEL_EXCEPTION_FILTER = Option<
    unsafe extern "system" fn(exceptioninfo: *const crash_context::EXCEPTION_POINTERS) -> i32,
>;

unsafe extern "system" {
    fn GetCurrentThreadId() -> u32;
    fn SetUnhandledExceptionFilter(
        filter: LPTOP_LEVEL_EXCEPTION_FILTER,
    ) -> LPTOP_LEVEL_EXCEPTION_FILTER;
    fn SetThreadStackGuarantee(stack_size_in_bytes: *mut u32) -> i32;
    fn Sleep(milliseconds: u32);
}

/// The handler is not entered, and the OS continues searching for an exception handler.
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;
/// Enter the exception handler, which terminates the process
const EXCEPTION_EXECUTE_HANDLER: i32 = 1;
const INFINITE: u32 = u32::MAX;

pub(super) static HANDLER: parking_lot::Mutex<Option<Arc<CrashReporter>>> =
    parking_lot::const_mutex(None);

/// The stack headroom reserved for each thread, in bytes
static STACK_GUARANTEE: AtomicU32 = AtomicU32::new(crate::config::DEFAULT_EMERGENCY_STACK_SIZE as u32);

/// The id of the thread handling an exception, 0 if none is
static HANDLING_THREAD: AtomicU32 = AtomicU32::new(0);

/// Reserves stack space that is still available to the exception filter when
/// the thread overflows its stack
unsafe fn reserve_stack(size: u32) -> Result<(), Error> {
    let mut size = size;

    // SAFETY: syscall
    if unsafe { SetThreadStackGuarantee(&mut size) } == 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    Ok(())
}

pub(super) fn install(reporter: Arc<CrashReporter>) -> Result<(), Error> {
    let mut lock = HANDLER.lock();

    let size = u32::try_from(reporter.config().emergency_stack_size).unwrap_or(u32::MAX);
    STACK_GUARANTEE.store(size, Ordering::Relaxed);

    // SAFETY: syscalls
    unsafe {
        reserve_stack(size)?;
        SetUnhandledExceptionFilter(Some(handle_exception));

        if let Err(err) = super::signal::install_abort_handler() {
            log::warn!("unable to install SIGABRT handler: {err}");
        }
    }

    if lock.replace(reporter).is_some() {
        log::debug!("replaced the previously installed crash reporter");
    }

    Ok(())
}

pub(super) fn prepare_thread() -> Result<(), Error> {
    // SAFETY: syscall
    unsafe { reserve_stack(STACK_GUARANTEE.load(Ordering::Relaxed)) }
}

/// Called on the exception thread when an unhandled exception occurs.
pub(super) unsafe extern "system" fn handle_exception(
    except_info: *const crash_context::EXCEPTION_POINTERS,
) -> i32 {
    // The lock is released before handling so an exception in the pipeline
    // can't deadlock on it
    let Some(reporter) = HANDLER.lock().clone() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    unsafe {
        let code = (*(*except_info).ExceptionRecord).ExceptionCode;
        report(&reporter, except_info, code);
    }

    // Returning EXCEPTION_EXECUTE_HANDLER indicates the exception was handled,
    // which results in the application being terminated.
    EXCEPTION_EXECUTE_HANDLER
}

/// Reports an exception raised by the system, or made up to look like one
pub(super) unsafe fn report(
    reporter: &CrashReporter,
    except_info: *const crash_context::EXCEPTION_POINTERS,
    exception_code: i32,
) {
    unsafe {
        let tid = GetCurrentThreadId();

        match HANDLING_THREAD.compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {}
            Err(owner) if owner == tid => {
                crate::write_stderr(crate::handler::REENTRY_MESSAGE);
                libc::_exit(crate::EMERGENCY_EXIT_CODE);
            }
            Err(_) => {
                // Another thread is already reporting, it will terminate the
                // process once it's done
                loop {
                    Sleep(INFINITE);
                }
            }
        }

        let capture = ExceptionCapture::new(crash_context::CrashContext {
            exception_pointers: except_info,
            process_id: std::process::id(),
            thread_id: tid,
            exception_code,
        });

        if reporter.handle_fault(&capture) == Disposition::Reentered {
            libc::_exit(crate::EMERGENCY_EXIT_CODE);
        }
    }
}

/// Calls `f` with a made up exception record for `exception_code` and the
/// current thread's CPU context
unsafe fn with_simulated_exception<R>(
    exception_code: i32,
    f: impl FnOnce(*const crash_context::EXCEPTION_POINTERS) -> R,
) -> R {
    unsafe {
        let mut exception_record: crash_context::EXCEPTION_RECORD = std::mem::zeroed();
        let mut exception_context = std::mem::MaybeUninit::zeroed();

        crash_context::capture_context(exception_context.as_mut_ptr());

        let mut exception_context = exception_context.assume_init();

        exception_record.ExceptionCode = exception_code;

        let exception_ptrs = crash_context::EXCEPTION_POINTERS {
            ExceptionRecord: &mut exception_record,
            ContextRecord: &mut exception_context,
        };

        f(&exception_ptrs)
    }
}

/// Reports a made up exception for the current thread and CPU context, for
/// faults that don't raise one themselves
pub(super) unsafe fn simulate_exception(exception_code: i32) {
    let Some(reporter) = HANDLER.lock().clone() else {
        return;
    };

    unsafe {
        with_simulated_exception(exception_code, |exception_ptrs| {
            report(&reporter, exception_ptrs, exception_code);
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn simulated_exception_carries_code() {
        let abort = crate::codes::ABORT as i32;

        // SAFETY: the pointers are only read while they are alive
        let (code, has_context) = unsafe {
            with_simulated_exception(abort, |ptrs| {
                (
                    (*(*ptrs).ExceptionRecord).ExceptionCode,
                    !(*ptrs).ContextRecord.is_null(),
                )
            })
        };

        assert_eq!(code, abort);
        assert!(has_context);
    }
}
