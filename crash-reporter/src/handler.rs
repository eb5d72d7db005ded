use crate::{
    Classification, Config, ConsoleNotifier, CrashReport, FaultTimestamp, FileLogWriter,
    LogWriter, MemoryAccess, Notifier, SnapshotError, SnapshotStatus, StackFrame, classify,
    snapshot,
};
use std::{
    fs::File,
    sync::atomic::{AtomicU8, Ordering},
};

/// Written to stderr when a fault occurs while a previous one is being handled
pub(crate) const REENTRY_MESSAGE: &str =
    "fault occurred while handling a previous fault, terminating\n";

/// The fault details read from the platform's trap record, before being
/// stamped with the time it is handled
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawFault {
    /// The fault code, see [`crate::codes`]
    pub code: u32,
    /// The address of the faulting instruction
    pub instruction_address: u64,
    /// The data access, only for memory access violations
    pub access: Option<MemoryAccess>,
    /// The id of the faulting thread
    pub thread_id: u32,
    /// The raw signal number and `si_code`, on the signal based platform
    pub signal: Option<(i32, i32)>,
}

/// A single fault, captured once per handler invocation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaultEvent {
    pub code: u32,
    pub instruction_address: u64,
    pub access: Option<MemoryAccess>,
    pub thread_id: u32,
    pub signal: Option<(i32, i32)>,
    pub timestamp: FaultTimestamp,
}

impl FaultEvent {
    #[inline]
    pub fn new(raw: RawFault, timestamp: FaultTimestamp) -> Self {
        Self {
            code: raw.code,
            instruction_address: raw.instruction_address,
            access: raw.access,
            thread_id: raw.thread_id,
            signal: raw.signal,
            timestamp,
        }
    }

    #[inline]
    pub fn classify(&self) -> Classification {
        classify(self.code, self.access)
    }
}

/// Platform specific access to the state of a fault.
///
/// This is implemented by [`crate::SignalCapture`] on Linux and
/// [`crate::ExceptionCapture`] on Windows, each inspecting the trap context
/// with the native primitives of the platform.
pub trait FaultCapture {
    /// Reads the fault record
    fn raw_fault(&self) -> RawFault;
    /// Walks the faulting thread's stack, at most `max_frames` deep
    fn walk_stack(&self, max_frames: usize) -> Vec<StackFrame>;
    /// Writes a minidump of the process, blaming the faulting thread
    fn write_snapshot(&self, file: &mut File) -> Result<(), SnapshotError>;
}

/// What the platform layer should do once [`CrashReporter::handle_fault`]
/// returns. In neither case is execution resumed.
#[must_use]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The fault was fully handled, the process should terminate
    Handled,
    /// The reporter was already handling a fault, the process must be torn
    /// down immediately
    Reentered,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerState {
    /// Waiting for a fault
    Armed = 0,
    /// A fault is being, or has been, handled. This is terminal.
    Handling = 1,
}

/// The fault handler: sequences classification, unwinding and the minidump,
/// then hands the report to the [`LogWriter`] and the [`Notifier`]
pub struct CrashReporter {
    config: Config,
    notifier: Box<dyn Notifier>,
    log_writer: Box<dyn LogWriter>,
    state: AtomicU8,
}

impl CrashReporter {
    /// Creates a reporter that writes its log with [`FileLogWriter`] and
    /// notifies with [`ConsoleNotifier`]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            notifier: Box::new(ConsoleNotifier),
            log_writer: Box::new(FileLogWriter),
            state: AtomicU8::new(HandlerState::Armed as u8),
        }
    }

    #[inline]
    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    #[inline]
    pub fn with_log_writer(mut self, log_writer: impl LogWriter + 'static) -> Self {
        self.log_writer = Box::new(log_writer);
        self
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn state(&self) -> HandlerState {
        if self.state.load(Ordering::Acquire) == HandlerState::Armed as u8 {
            HandlerState::Armed
        } else {
            HandlerState::Handling
        }
    }

    /// Handles the fault described by `capture`, stamped with the current time
    #[inline]
    pub fn handle_fault(&self, capture: &dyn FaultCapture) -> Disposition {
        self.handle_fault_at(capture, FaultTimestamp::now())
    }

    /// Handles the fault described by `capture`.
    ///
    /// Every stage runs exactly once, in order, regardless of whether an
    /// earlier stage failed. Only the first call does any work, every later
    /// call writes a single line to stderr and returns
    /// [`Disposition::Reentered`].
    pub fn handle_fault_at(
        &self,
        capture: &dyn FaultCapture,
        timestamp: FaultTimestamp,
    ) -> Disposition {
        if self
            .state
            .compare_exchange(
                HandlerState::Armed as u8,
                HandlerState::Handling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            crate::write_stderr(REENTRY_MESSAGE);
            return Disposition::Reentered;
        }

        debug_print!("handling fault");

        let event = FaultEvent::new(capture.raw_fault(), timestamp);
        let classification = event.classify();

        log::debug!("stackwalk thread: {}", event.thread_id);
        let frames = capture.walk_stack(self.config.max_frames);

        let output_dir = self.config.resolve_output_dir();

        let snapshot = if self.config.create_snapshot {
            log::debug!("minidump thread: {}", event.thread_id);
            SnapshotStatus::Attempted(snapshot::write_snapshot(capture, &output_dir, &timestamp))
        } else {
            SnapshotStatus::Skipped
        };

        let report = CrashReport::assemble(&self.config, &event, &classification, &frames, &snapshot);

        let log_name = timestamp.log_file_name();
        match self
            .log_writer
            .write_log(&output_dir, &log_name, report.as_str())
        {
            Ok(path) => log::debug!("wrote crash log to '{}'", path.display()),
            Err(err) => {
                log::error!("failed to write crash log: {err}");
                crate::write_stderr(&format!(
                    "failed to write crash log '{}': {err}\n",
                    output_dir.join(&log_name).display()
                ));
            }
        }

        self.notifier
            .notify(&self.config.notification_title(), &report);

        Disposition::Handled
    }
}
