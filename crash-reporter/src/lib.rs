//! [`CrashReporter`] is a last-resort, process-wide fault handler. When the
//! process hits an unrecoverable fault it classifies the fault, walks the call
//! stack of the faulting thread, writes a minidump next to the executable, and
//! hands the assembled report to a [`Notifier`] before the process exits.
//!
//! The pipeline itself is platform agnostic and is driven through the
//! [`FaultCapture`] trait, so it can be exercised without installing a real
//! fault filter. [`initialize`] is the only entry point that touches process
//! wide state.
//!
//! # Linux
//!
//! On Linux faults arrive as [signals](https://man7.org/linux/man-pages/man7/signal.7.html),
//! namely `SIGABRT`, `SIGBUS`, `SIGFPE`, `SIGILL`, `SIGSEGV` and `SIGTRAP`.
//! The handler runs on an [alternate signal stack](https://man7.org/linux/man-pages/man2/sigaltstack.2.html)
//! so that a `SIGSEGV` caused by a stack overflow can still be reported.
//! Alternate stacks are per thread, [`initialize`] installs one for the
//! calling thread and [`prepare_thread`] can be called from any other thread
//! that should get the same guarantee.
//!
//! # Windows
//!
//! On Windows the reporter is installed as the
//! [unhandled exception filter](https://learn.microsoft.com/en-us/windows/win32/api/errhandlingapi/nf-errhandlingapi-setunhandledexceptionfilter),
//! after reserving stack headroom with `SetThreadStackGuarantee`. Aborts do not
//! raise an exception, so `SIGABRT` is hooked as well.

#![allow(unsafe_code)]

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

mod classify;
mod config;
mod error;
mod handler;
mod notify;
mod report;
mod snapshot;
mod timestamp;
pub mod unwind;

pub use classify::{AccessKind, Classification, FaultKind, MemoryAccess, classify, codes};
pub use config::{Config, DEFAULT_EMERGENCY_STACK_SIZE, DEFAULT_MAX_FRAMES};
pub use error::Error;
pub use handler::{CrashReporter, Disposition, FaultCapture, FaultEvent, HandlerState, RawFault};
pub use notify::{ConsoleNotifier, FileLogWriter, LogWriter, Notifier};
pub use report::CrashReport;
pub use snapshot::{SnapshotArtifact, SnapshotError, SnapshotStatus};
pub use timestamp::{FaultTimestamp, sanitize_file_component};
pub use unwind::{ResolveError, SourceLocation, StackFrame};

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &str) {
    unsafe {
        #[cfg(target_os = "windows")]
        libc::write(2, s.as_ptr().cast(), s.len() as u32);

        #[cfg(not(target_os = "windows"))]
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

/// Exit code used when the process has to be torn down without a report, eg.
/// when a second fault occurs while the first one is still being handled
pub const EMERGENCY_EXIT_CODE: i32 = 0xde;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::{Signal, SignalCapture};
        use linux as platform;
    } else if #[cfg(target_os = "windows")] {
        mod windows;

        pub use windows::ExceptionCapture;
        use windows as platform;
    }
}

/// Installs `reporter` as the process-wide last-resort fault handler.
///
/// The emergency stack for the calling thread is reserved before the handler
/// is installed. Calling this again re-installs the handler and replaces the
/// previously registered reporter.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "windows"))]
pub fn initialize(reporter: CrashReporter) -> Result<(), Error> {
    platform::install(std::sync::Arc::new(reporter))
}

/// Reserves the emergency stack for the calling thread, using the size
/// configured on the installed reporter.
///
/// Threads created after [`initialize`] need this to get a usable report for
/// a stack overflow.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "windows"))]
pub fn prepare_thread() -> Result<(), Error> {
    platform::prepare_thread()
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "windows")))]
pub fn initialize(_reporter: CrashReporter) -> Result<(), Error> {
    Err(Error::Unsupported)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "windows")))]
pub fn prepare_thread() -> Result<(), Error> {
    Err(Error::Unsupported)
}
