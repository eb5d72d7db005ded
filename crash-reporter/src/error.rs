/// An error that can occur when installing the [`crate::CrashReporter`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Unable to map memory for the emergency stack
    #[error("unable to allocate memory")]
    OutOfMemory,
    /// An I/O or other syscall failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Fault interception is not implemented for the current target
    #[error("fault handling is not supported on this platform")]
    Unsupported,
}
