mod signal;
mod stackwalk;
mod state;

use crate::{
    AccessKind, CrashReporter, Error, FaultCapture, MemoryAccess, RawFault, SnapshotError,
    StackFrame, codes, unwind,
};
use std::sync::Arc;

/// The state of an exception delivered to the unhandled exception filter
pub struct ExceptionCapture {
    context: crash_context::CrashContext,
}

impl ExceptionCapture {
    /// # Safety
    ///
    /// The exception pointers in `context` must be valid for the lifetime of
    /// the capture
    #[inline]
    pub unsafe fn new(context: crash_context::CrashContext) -> Self {
        Self { context }
    }

    #[inline]
    fn record(&self) -> &crash_context::EXCEPTION_RECORD {
        // SAFETY: upheld by the constructor
        unsafe { &*(*self.context.exception_pointers).ExceptionRecord }
    }
}

/// Reads the access details of an access violation from its exception parameters
fn access_from_record(record: &crash_context::EXCEPTION_RECORD) -> Option<MemoryAccess> {
    (record.NumberParameters >= 2).then(|| MemoryAccess {
        kind: AccessKind::from_raw(record.ExceptionInformation[0] as u64),
        address: record.ExceptionInformation[1] as u64,
    })
}

impl FaultCapture for ExceptionCapture {
    fn raw_fault(&self) -> RawFault {
        let record = self.record();
        let code = self.context.exception_code as u32;

        RawFault {
            code,
            instruction_address: record.ExceptionAddress as usize as u64,
            access: if code == codes::ACCESS_VIOLATION {
                access_from_record(record)
            } else {
                None
            },
            thread_id: self.context.thread_id,
            signal: None,
        }
    }

    fn walk_stack(&self, max_frames: usize) -> Vec<StackFrame> {
        // SAFETY: the context record is valid for our lifetime
        let session = unsafe { stackwalk::SymbolSession::initialize() };
        let Some(session) = session else {
            log::error!("failed to initialize the symbol engine");
            return Vec::new();
        };

        // SAFETY: as above
        let mut walker = unsafe { session.walker(self.context.exception_pointers) };
        unwind::unwind(&mut walker, &session, max_frames)
    }

    fn write_snapshot(&self, file: &mut std::fs::File) -> Result<(), SnapshotError> {
        let cc = crash_context::CrashContext {
            exception_pointers: self.context.exception_pointers,
            process_id: self.context.process_id,
            thread_id: self.context.thread_id,
            exception_code: self.context.exception_code,
        };

        minidump_writer::minidump_writer::MinidumpWriter::dump_crash_context(cc, None, file)?;
        Ok(())
    }
}

pub(crate) fn install(reporter: Arc<CrashReporter>) -> Result<(), Error> {
    state::install(reporter)
}

pub(crate) fn prepare_thread() -> Result<(), Error> {
    state::prepare_thread()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_access_violation_parameters() {
        // SAFETY: plain old data
        let mut record: crash_context::EXCEPTION_RECORD = unsafe { std::mem::zeroed() };
        record.ExceptionCode = codes::ACCESS_VIOLATION as i32;
        record.NumberParameters = 2;
        record.ExceptionInformation[0] = 1;
        record.ExceptionInformation[1] = 0xdead_0000;

        let access = access_from_record(&record).unwrap();
        assert_eq!(access.kind, AccessKind::Write);
        assert_eq!(access.address, 0xdead_0000);

        record.NumberParameters = 0;
        assert!(access_from_record(&record).is_none());
    }

    #[test]
    fn captures_exception() {
        // SAFETY: plain old data
        let mut record: crash_context::EXCEPTION_RECORD = unsafe { std::mem::zeroed() };
        record.ExceptionCode = codes::ACCESS_VIOLATION as i32;
        record.ExceptionAddress = 0x4000 as *mut _;
        record.NumberParameters = 2;
        record.ExceptionInformation[0] = 8;
        record.ExceptionInformation[1] = 0x4000;

        let mut context = std::mem::MaybeUninit::zeroed();
        // SAFETY: the context is written in full
        let mut context = unsafe {
            crash_context::capture_context(context.as_mut_ptr());
            context.assume_init()
        };

        let pointers = crash_context::EXCEPTION_POINTERS {
            ExceptionRecord: &mut record,
            ContextRecord: &mut context,
        };

        // SAFETY: the pointers outlive the capture
        let capture = unsafe {
            ExceptionCapture::new(crash_context::CrashContext {
                exception_pointers: &pointers,
                process_id: std::process::id(),
                thread_id: 7,
                exception_code: codes::ACCESS_VIOLATION as i32,
            })
        };

        let raw = capture.raw_fault();
        assert_eq!(raw.instruction_address, 0x4000);
        assert_eq!(raw.thread_id, 7);
        assert_eq!(
            raw.access,
            Some(MemoryAccess {
                kind: AccessKind::Execute,
                address: 0x4000
            })
        );
    }
}
