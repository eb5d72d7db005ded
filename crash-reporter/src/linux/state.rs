use super::{Signal, SignalCapture};
use crate::{CrashReporter, Disposition, Error};
use std::{
    mem, ptr,
    sync::{
        Arc,
        atomic::{AtomicI32, AtomicUsize, Ordering},
    },
};

/// The minimum size of the alternate stack that is mapped for every thread.
///
/// Symbolication needs a lot more headroom than just writing a message, but
/// this memory will only ever be committed in case we actually get a stack
/// overflow
const MIN_STACK_SIZE: usize = 256 * 1024;

/// The size of the alternate stack the reporter was installed with
static STACK_SIZE: AtomicUsize = AtomicUsize::new(MIN_STACK_SIZE);

/// Create an alternative stack to run the signal handlers on. This is done since
/// the signal might have been caused by a stack overflow.
///
/// The mapping lives for the remainder of the process.
unsafe fn install_sigaltstack(size: usize) -> Result<(), Error> {
    let size = size.max(MIN_STACK_SIZE).max(libc::SIGSTKSZ);

    unsafe {
        // Check to see if the existing sigaltstack, and if it exists, is it big
        // enough. If so we don't need to allocate our own.
        let mut old_stack = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old_stack) == -1 {
            return Err(std::io::Error::last_os_error().into());
        }

        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= size {
            return Ok(());
        }

        // ... but failing that we need to allocate our own, with a guard page
        // below it
        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let alloc_size = guard_size + size;

        let ptr = libc::mmap(
            ptr::null_mut(),
            alloc_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }

        let stack_ptr = (ptr as usize + guard_size) as *mut libc::c_void;
        if libc::mprotect(stack_ptr, size, libc::PROT_READ | libc::PROT_WRITE) == -1 {
            let err = std::io::Error::last_os_error();
            libc::munmap(ptr, alloc_size);
            return Err(err.into());
        }

        let new_stack = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: size,
        };
        if libc::sigaltstack(&new_stack, ptr::null_mut()) == -1 {
            let err = std::io::Error::last_os_error();
            libc::munmap(ptr, alloc_size);
            return Err(err.into());
        }

        Ok(())
    }
}

/// Restores the signal handler for the specified signal back to its default
/// handler, which _should_ perform the default signal action as seen in
/// <https://man7.org/linux/man-pages/man7/signal.7.html>
#[inline]
unsafe fn install_default_handler(sig: Signal) {
    // Android L+ expose signal and sigaction symbols that override the system
    // ones. There is a bug in these functions where a request to set the handler
    // to SIG_DFL is ignored. In that case, an infinite loop is entered as the
    // signal is repeatedly sent to our signal handler.
    // To work around this, directly call the system's sigaction.
    unsafe {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                let mut sa: libc::sigaction = mem::zeroed();
                libc::sigemptyset(&mut sa.sa_mask);
                sa.sa_sigaction = libc::SIG_DFL;
                sa.sa_flags = libc::SA_RESTART;
                libc::syscall(
                    libc::SYS_rt_sigaction,
                    sig as i32,
                    &sa,
                    ptr::null::<libc::sigaction>(),
                    mem::size_of::<libc::sigset_t>(),
                );
            } else {
                libc::signal(sig as i32, libc::SIG_DFL);
            }
        }
    }
}

/// The various signals we attempt to handle
const EXCEPTION_SIGNALS: [Signal; 6] = [
    Signal::Abort,
    Signal::Bus,
    Signal::Fpe,
    Signal::Illegal,
    Signal::Segv,
    Signal::Trap,
];

/// Restores the default action of every signal we handle
pub(super) unsafe fn install_default_handlers() {
    for sig in EXCEPTION_SIGNALS {
        unsafe { install_default_handler(sig) };
    }
}

unsafe fn install_handlers() -> Result<(), Error> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Mask all exception signals when we're handling one of them.
        for sig in EXCEPTION_SIGNALS {
            libc::sigaddset(&mut sa.sa_mask, sig as i32);
        }

        sa.sa_sigaction = signal_handler as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

        for sig in EXCEPTION_SIGNALS {
            if libc::sigaction(sig as i32, &sa, ptr::null_mut()) == -1 {
                return Err(std::io::Error::last_os_error().into());
            }
        }

        Ok(())
    }
}

pub(super) static HANDLER: parking_lot::Mutex<Option<Arc<CrashReporter>>> =
    parking_lot::const_mutex(None);

pub(super) fn install(reporter: Arc<CrashReporter>) -> Result<(), Error> {
    let mut lock = HANDLER.lock();

    let stack_size = reporter.config().emergency_stack_size;
    STACK_SIZE.store(stack_size, Ordering::Relaxed);

    // SAFETY: syscalls
    unsafe {
        install_sigaltstack(stack_size)?;
        install_handlers()?;
    }

    if lock.replace(reporter).is_some() {
        log::debug!("replaced the previously installed crash reporter");
    }

    Ok(())
}

pub(super) fn prepare_thread() -> Result<(), Error> {
    // SAFETY: syscalls
    unsafe { install_sigaltstack(STACK_SIZE.load(Ordering::Relaxed)) }
}

/// The kernel thread id of the thread handling a fault, 0 if none is
static HANDLING_THREAD: AtomicI32 = AtomicI32::new(0);

/// The size of `CrashContext` can be too big w.r.t the size of alternate stack
/// for `signal_handler`. Keep the crash context as a .bss field.
static CRASH_CONTEXT: parking_lot::Mutex<crash_context::CrashContext> =
    parking_lot::const_mutex(unsafe { mem::zeroed() });

/// This is the actual function installed for each signal we support, invoked
/// by the kernel
unsafe extern "C" fn signal_handler(
    sig: Signal,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        let info = &mut *info;
        let uc = &mut *uc;

        // We might run inside a process where some other buggy code saves and
        // restores signal handlers temporarily with `signal` instead of `sigaction`.
        // This loses the `SA_SIGINFO` flag associated with this function. As a
        // consequence, the values of `info` and `uc` become totally bogus,
        // generally inducing a crash.
        //
        // The following code tries to detect this case. When it does, it
        // resets the signal handlers with `sigaction` & `SA_SIGINFO` and returns.
        // This forces the signal to be thrown again, but this time the kernel
        // will call the function with the right arguments.
        {
            let mut cur_handler = mem::zeroed();
            if libc::sigaction(sig as i32, ptr::null_mut(), &mut cur_handler) == 0
                && cur_handler.sa_sigaction == signal_handler as usize
                && cur_handler.sa_flags & libc::SA_SIGINFO == 0
            {
                // Reset signal handler with the correct flags.
                libc::sigemptyset(&mut cur_handler.sa_mask);
                libc::sigaddset(&mut cur_handler.sa_mask, sig as i32);

                cur_handler.sa_sigaction = signal_handler as usize;
                cur_handler.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

                if libc::sigaction(sig as i32, &cur_handler, ptr::null_mut()) == -1 {
                    // When resetting the handler fails, try to reset the
                    // default one to avoid an infinite loop here.
                    install_default_handler(sig);
                }

                // exit the handler as we should be called again soon
                return;
            }
        }

        // The lock is released before handling so a fault in the pipeline can't
        // deadlock on it
        let reporter = HANDLER.lock().clone();

        if let Some(reporter) = reporter {
            let tid = libc::syscall(libc::SYS_gettid) as i32;

            match HANDLING_THREAD.compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {}
                Err(owner) if owner == tid => {
                    // The pipeline itself faulted, the crash context is still
                    // locked by the outer invocation
                    crate::write_stderr(crate::handler::REENTRY_MESSAGE);
                    libc::_exit(crate::EMERGENCY_EXIT_CODE);
                }
                Err(_) => {
                    // Another thread is already reporting, it will terminate
                    // the process once it's done
                    debug_print!("parking thread");
                    loop {
                        libc::pause();
                    }
                }
            }

            if handle_signal(&reporter, info, uc) == Disposition::Reentered {
                libc::_exit(crate::EMERGENCY_EXIT_CODE);
            }
        }

        // Upon returning from this signal handler, sig will become unmasked and
        // then it will be retriggered, this time with the default action which
        // terminates the process
        debug_print!("installing default handler");
        install_default_handler(sig);

        debug_print!("finishing signal handler");

        if info.si_code <= 0 || sig == Signal::Abort || sig == Signal::Trap {
            // This signal was triggered by somebody sending us the signal with kill().
            // In order to retrigger it, we have to queue a new signal by calling
            // kill() ourselves.  The special case (si_pid == 0 && sig == SIGABRT) is
            // due to the kernel sending a SIGABRT from a user request via SysRQ.
            // Traps resume after the breakpoint instruction, so they need to be
            // raised as well.
            let tid = libc::syscall(libc::SYS_gettid) as i32;
            if libc::syscall(libc::SYS_tgkill, std::process::id(), tid, sig) < 0 {
                // If we failed to kill ourselves (e.g. because a sandbox disallows us
                // to do so), we instead resort to terminating our process. This will
                // result in an incorrect exit code.
                libc::_exit(1);
            }
        } else {
            // This was a synchronous signal triggered by a hard fault (e.g. SIGSEGV).
            // No need to reissue the signal. It will automatically trigger again,
            // when we return from the signal handler.
        }
    }
}

unsafe fn handle_signal(
    reporter: &CrashReporter,
    info: &mut libc::siginfo_t,
    uc: &mut libc::c_void,
) -> Disposition {
    unsafe {
        let siginfo = super::signalfd_siginfo(info);

        debug_print!("acquired siginfo");

        let mut cc = CRASH_CONTEXT.lock();

        {
            use std::ops::DerefMut;
            #[allow(clippy::explicit_deref_methods)]
            ptr::write_bytes(cc.deref_mut(), 0, 1);
            debug_print!("zeroed crashctx");

            cc.siginfo = siginfo;
            debug_print!("copied siginfo");

            let uc_ptr = &*(uc as *const libc::c_void).cast::<crash_context::ucontext_t>();
            ptr::copy_nonoverlapping(uc_ptr, &mut cc.context, 1);
            debug_print!("copied context");

            cfg_if::cfg_if! {
                if #[cfg(target_arch = "aarch64")] {
                    let fp_ptr = uc_ptr.uc_mcontext.__reserved.as_ptr().cast::<crash_context::fpsimd_context>();

                    if (*fp_ptr).head.magic == crash_context::FPSIMD_MAGIC {
                        ptr::copy_nonoverlapping(fp_ptr, &mut cc.float_state, 1);
                    }
                } else if #[cfg(not(target_arch = "arm"))] {
                    if !uc_ptr.uc_mcontext.fpregs.is_null() {
                        ptr::copy_nonoverlapping(uc_ptr.uc_mcontext.fpregs, ((&mut cc.float_state) as *mut crash_context::fpregset_t).cast(), 1);
                    }
                }
            }

            cc.pid = std::process::id() as i32;
            cc.tid = libc::syscall(libc::SYS_gettid) as i32;
        }

        reporter.handle_fault(&SignalCapture::new(&cc))
    }
}

/// We define these constans ourselves rather than use libc as they are missing
/// from eg. Android
const PR_GET_DUMPABLE: i32 = 3;
const PR_SET_DUMPABLE: i32 = 4;
const PR_SET_PTRACER: i32 = 0x59616d61;
const PR_SET_PTRACER_ANY: i32 = -1;

/// Helper that sets the process as dumpable if it is not, and when dropped
/// returns it back to the original state if needed
pub(super) struct SetDumpable {
    was_dumpable: bool,
}

impl SetDumpable {
    pub(super) unsafe fn new() -> Self {
        unsafe {
            let is_dumpable = libc::syscall(libc::SYS_prctl, PR_GET_DUMPABLE, 0, 0, 0, 0);
            let was_dumpable = is_dumpable > 0;

            if !was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 1, 0, 0, 0);
            }

            // The dump helper is our child, which `ptrace_scope` = 1 does not
            // allow to attach to its parent, so allow any process. This has no
            // negative impact if it is in any other mode
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, PR_SET_PTRACER_ANY, 0, 0, 0);

            Self { was_dumpable }
        }
    }
}

impl Drop for SetDumpable {
    fn drop(&mut self) {
        unsafe {
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, 0, 0, 0, 0);

            if !self.was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 0, 0, 0, 0);
            }
        }
    }
}
