mod dump;
mod state;
mod stackwalk;

use crate::{
    AccessKind, CrashReporter, Error, FaultCapture, MemoryAccess, RawFault, SnapshotError,
    StackFrame, codes, unwind,
};
use std::sync::Arc;

/// The signals that we catch
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    Abort = libc::SIGABRT,
    Bus = libc::SIGBUS,
    Fpe = libc::SIGFPE,
    Illegal = libc::SIGILL,
    Segv = libc::SIGSEGV,
    Trap = libc::SIGTRAP,
}

impl Signal {
    #[inline]
    pub fn from_raw(signo: i32) -> Option<Self> {
        Some(match signo {
            libc::SIGABRT => Self::Abort,
            libc::SIGBUS => Self::Bus,
            libc::SIGFPE => Self::Fpe,
            libc::SIGILL => Self::Illegal,
            libc::SIGSEGV => Self::Segv,
            libc::SIGTRAP => Self::Trap,
            _ => return None,
        })
    }
}

/// `si_code` values, these aren't exposed by libc
const ILL_PRVOPC: i32 = 5;
const ILL_PRVREG: i32 = 6;
const FPE_INTDIV: i32 = 1;

/// A `SIGSEGV` whose fault address is this close to the stack pointer is
/// reported as a stack overflow
const STACK_OVERFLOW_WINDOW: u64 = 64 * 1024;

/// Translates a signal into one of the canonical fault [`codes`].
///
/// Signals without a canonical counterpart are passed through as the raw
/// signal number.
pub fn fault_code(signo: i32, si_code: i32, fault_address: u64, sp: u64) -> u32 {
    let Some(signal) = Signal::from_raw(signo) else {
        return signo as u32;
    };

    match signal {
        Signal::Segv if fault_address.abs_diff(sp) <= STACK_OVERFLOW_WINDOW => {
            codes::STACK_OVERFLOW
        }
        Signal::Segv => codes::ACCESS_VIOLATION,
        Signal::Bus => codes::IN_PAGE_ERROR,
        Signal::Illegal if matches!(si_code, ILL_PRVOPC | ILL_PRVREG) => codes::PRIV_INSTRUCTION,
        Signal::Illegal => codes::ILLEGAL_INSTRUCTION,
        Signal::Fpe if si_code == FPE_INTDIV => codes::INT_DIVIDE_BY_ZERO,
        Signal::Fpe => signo as u32,
        Signal::Trap => codes::BREAKPOINT,
        Signal::Abort => codes::ABORT,
    }
}

/// Maps an x86 page fault error code to the kind of access that faulted
#[inline]
pub fn access_from_error_code(err: u64) -> AccessKind {
    const WRITE: u64 = 0x2;
    const INSTRUCTION_FETCH: u64 = 0x10;

    if err & INSTRUCTION_FETCH != 0 {
        AccessKind::Execute
    } else if err & WRITE != 0 {
        AccessKind::Write
    } else {
        AccessKind::Read
    }
}

/// Converts the `siginfo_t` a signal handler receives into the
/// `signalfd_siginfo` stored in the crash context.
///
/// Only the first three fields share a layout, the rest are read from the
/// union member that is valid for the signal.
pub(crate) fn signalfd_siginfo(info: &libc::siginfo_t) -> libc::signalfd_siginfo {
    // SAFETY: signalfd_siginfo is plain old data
    let mut ssi: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
    ssi.ssi_signo = info.si_signo as u32;
    ssi.ssi_errno = info.si_errno;
    ssi.ssi_code = info.si_code;

    // SAFETY: the kernel fills in the union member matching `si_code` and the
    // signal number
    unsafe {
        if info.si_code <= 0 {
            // Sent by kill, tgkill or sigqueue
            ssi.ssi_pid = info.si_pid() as u32;
            ssi.ssi_uid = info.si_uid();
        } else if Signal::from_raw(info.si_signo).is_some_and(|sig| sig != Signal::Abort) {
            ssi.ssi_addr = info.si_addr() as usize as u64;
        }
    }

    ssi
}

/// The registers needed to start a stack walk
#[derive(Copy, Clone, Debug, Default)]
struct Registers {
    pc: u64,
    fp: u64,
    sp: u64,
    /// The page fault error code, if the architecture provides one
    fault_error: Option<u64>,
}

impl Registers {
    #[cfg(target_arch = "x86_64")]
    fn from_context(cc: &crash_context::CrashContext) -> Self {
        let gregs = &cc.context.uc_mcontext.gregs;

        Self {
            pc: gregs[libc::REG_RIP as usize] as u64,
            fp: gregs[libc::REG_RBP as usize] as u64,
            sp: gregs[libc::REG_RSP as usize] as u64,
            fault_error: Some(gregs[libc::REG_ERR as usize] as u64),
        }
    }

    #[cfg(target_arch = "x86")]
    fn from_context(cc: &crash_context::CrashContext) -> Self {
        let gregs = &cc.context.uc_mcontext.gregs;
        let reg = |i: i32| gregs[i as usize] as usize as u64;

        Self {
            pc: reg(libc::REG_EIP),
            fp: reg(libc::REG_EBP),
            sp: reg(libc::REG_ESP),
            fault_error: Some(reg(libc::REG_ERR)),
        }
    }

    #[cfg(target_arch = "aarch64")]
    fn from_context(cc: &crash_context::CrashContext) -> Self {
        let mcontext = &cc.context.uc_mcontext;

        Self {
            pc: mcontext.pc,
            fp: mcontext.regs[29],
            sp: mcontext.sp,
            fault_error: None,
        }
    }

    #[cfg(target_arch = "arm")]
    fn from_context(cc: &crash_context::CrashContext) -> Self {
        let mcontext = &cc.context.uc_mcontext;

        Self {
            pc: mcontext.arm_pc as u64,
            fp: mcontext.arm_fp as u64,
            sp: mcontext.arm_sp as u64,
            fault_error: None,
        }
    }

    #[cfg(not(any(
        target_arch = "x86_64",
        target_arch = "x86",
        target_arch = "aarch64",
        target_arch = "arm"
    )))]
    fn from_context(_cc: &crash_context::CrashContext) -> Self {
        Self::default()
    }
}

/// The state of a caught signal
pub struct SignalCapture<'cc> {
    context: &'cc crash_context::CrashContext,
    registers: Registers,
}

impl<'cc> SignalCapture<'cc> {
    pub fn new(context: &'cc crash_context::CrashContext) -> Self {
        Self {
            context,
            registers: Registers::from_context(context),
        }
    }

    #[inline]
    pub fn signal(&self) -> Option<Signal> {
        Signal::from_raw(self.context.siginfo.ssi_signo as i32)
    }
}

impl FaultCapture for SignalCapture<'_> {
    fn raw_fault(&self) -> RawFault {
        let info = &self.context.siginfo;
        let signo = info.ssi_signo as i32;
        let code = fault_code(signo, info.ssi_code, info.ssi_addr, self.registers.sp);

        // The fault address is only meaningful for memory faults, and only
        // access violations carry it into the classification
        let access = (code == codes::ACCESS_VIOLATION).then(|| MemoryAccess {
            kind: self
                .registers
                .fault_error
                .map_or(AccessKind::Unknown(u64::MAX), access_from_error_code),
            address: info.ssi_addr,
        });

        RawFault {
            code,
            instruction_address: self.registers.pc,
            access,
            thread_id: self.context.tid as u32,
            signal: Some((signo, info.ssi_code)),
        }
    }

    fn walk_stack(&self, max_frames: usize) -> Vec<StackFrame> {
        let resolver = stackwalk::Resolver::new();
        let Registers { pc, fp, sp, .. } = self.registers;

        // SAFETY: we're on the faulting thread, the unwinder only reads memory
        if let Some(frames) = unsafe { stackwalk::collect_frames(pc, max_frames) } {
            return unwind::unwind(&mut stackwalk::Collected::new(frames), &resolver, max_frames);
        }

        log::debug!("faulting frame not found by the unwinder, walking frame pointers");
        let mut walker = stackwalk::FramePointerWalker::new(pc, fp, sp, stackwalk::ProcessMemory);
        unwind::unwind(&mut walker, &resolver, max_frames)
    }

    fn write_snapshot(&self, file: &mut std::fs::File) -> Result<(), SnapshotError> {
        dump::write_minidump(self.context, file)
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
    fn translates_signals() {
        let far = 0x10;
        let sp = 0x7fff_0000_0000;

        assert_eq!(fault_code(libc::SIGSEGV, 1, far, sp), codes::ACCESS_VIOLATION);
        assert_eq!(fault_code(libc::SIGSEGV, 2, sp - 8, sp), codes::STACK_OVERFLOW);
        assert_eq!(fault_code(libc::SIGBUS, 2, far, sp), codes::IN_PAGE_ERROR);
        assert_eq!(fault_code(libc::SIGILL, 2, far, sp), codes::ILLEGAL_INSTRUCTION);
        assert_eq!(fault_code(libc::SIGILL, ILL_PRVOPC, far, sp), codes::PRIV_INSTRUCTION);
        assert_eq!(fault_code(libc::SIGILL, ILL_PRVREG, far, sp), codes::PRIV_INSTRUCTION);
        assert_eq!(fault_code(libc::SIGFPE, FPE_INTDIV, far, sp), codes::INT_DIVIDE_BY_ZERO);
        assert_eq!(fault_code(libc::SIGFPE, 3, far, sp), libc::SIGFPE as u32);
        assert_eq!(fault_code(libc::SIGTRAP, 0x80, far, sp), codes::BREAKPOINT);
        assert_eq!(fault_code(libc::SIGABRT, -6, 0, sp), codes::ABORT);
        assert_eq!(fault_code(libc::SIGUSR1, 0, 0, sp), libc::SIGUSR1 as u32);
    }

    #[test]
    fn page_fault_access() {
        assert_eq!(access_from_error_code(0x4), AccessKind::Read);
        assert_eq!(access_from_error_code(0x6), AccessKind::Write);
        assert_eq!(access_from_error_code(0x14), AccessKind::Execute);
    }

    /// The kernel's `siginfo_t` layout for faults
    #[repr(C)]
    struct FaultInfo {
        signo: i32,
        errno: i32,
        code: i32,
        addr: *mut libc::c_void,
    }

    #[repr(C)]
    struct KillFields {
        pid: i32,
        uid: u32,
        _align: [usize; 0],
    }

    /// The kernel's `siginfo_t` layout for signals sent by another process
    #[repr(C)]
    struct KillInfo {
        signo: i32,
        errno: i32,
        code: i32,
        fields: KillFields,
    }

    fn siginfo<T>(fields: T) -> libc::siginfo_t {
        assert!(std::mem::size_of::<T>() <= std::mem::size_of::<libc::siginfo_t>());

        // SAFETY: siginfo_t is plain old data, and large enough for `fields`
        unsafe {
            let mut info: libc::siginfo_t = std::mem::zeroed();
            std::ptr::write_unaligned((&mut info as *mut libc::siginfo_t).cast::<T>(), fields);
            info
        }
    }

    #[test]
    fn converts_fault_siginfo() {
        let info = siginfo(FaultInfo {
            signo: libc::SIGSEGV,
            errno: 0,
            code: 2,
            addr: 0xdead_0000usize as *mut libc::c_void,
        });

        let ssi = signalfd_siginfo(&info);
        assert_eq!(ssi.ssi_signo, libc::SIGSEGV as u32);
        assert_eq!(ssi.ssi_code, 2);
        assert_eq!(ssi.ssi_addr, 0xdead_0000);
        assert_eq!(ssi.ssi_pid, 0);

        // SAFETY: CrashContext is plain old data
        let mut cc: crash_context::CrashContext = unsafe { std::mem::zeroed() };
        cc.siginfo = ssi;

        let raw = SignalCapture::new(&cc).raw_fault();
        assert_eq!(raw.code, codes::ACCESS_VIOLATION);
        assert_eq!(raw.access.map(|access| access.address), Some(0xdead_0000));
    }

    #[test]
    fn converts_kill_siginfo() {
        const SI_TKILL: i32 = -6;

        let info = siginfo(KillInfo {
            signo: libc::SIGABRT,
            errno: 0,
            code: SI_TKILL,
            fields: KillFields {
                pid: 77,
                uid: 1000,
                _align: [],
            },
        });

        let ssi = signalfd_siginfo(&info);
        assert_eq!(ssi.ssi_signo, libc::SIGABRT as u32);
        assert_eq!(ssi.ssi_code, SI_TKILL);
        assert_eq!(ssi.ssi_pid, 77);
        assert_eq!(ssi.ssi_uid, 1000);
        assert_eq!(ssi.ssi_addr, 0);
    }

    #[test]
    fn captures_siginfo() {
        // SAFETY: CrashContext is plain old data
        let mut cc: crash_context::CrashContext = unsafe { std::mem::zeroed() };
        cc.siginfo.ssi_signo = libc::SIGSEGV as u32;
        cc.siginfo.ssi_code = 1;
        cc.siginfo.ssi_addr = 0xdead_0000;
        cc.tid = 42;

        let capture = SignalCapture::new(&cc);
        assert_eq!(capture.signal(), Some(Signal::Segv));

        let raw = capture.raw_fault();
        assert_eq!(raw.code, codes::ACCESS_VIOLATION);
        assert_eq!(raw.thread_id, 42);
        assert_eq!(raw.signal, Some((libc::SIGSEGV, 1)));
        assert_eq!(raw.access.map(|access| access.address), Some(0xdead_0000));
    }
}
