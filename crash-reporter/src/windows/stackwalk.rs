//! Stack walking and symbolication with DbgHelp

use crate::unwind::{FrameWalker, ResolveError, SymbolResolver};
use std::{ffi::CStr, mem, ptr};
use windows_sys::Win32::{
    Foundation::{ERROR_INVALID_ADDRESS, ERROR_MOD_NOT_FOUND, GetLastError, HANDLE},
    System::{
        Diagnostics::Debug as dbg,
        Threading::{GetCurrentProcess, GetCurrentThread},
    },
};

/// The maximum length of a symbol name that DbgHelp will return
const MAX_SYM_NAME: usize = 2000;

/// An initialized DbgHelp symbol engine for the current process, cleaned up
/// when dropped.
///
/// DbgHelp is single threaded, there must only be one session at a time.
pub(super) struct SymbolSession {
    process: HANDLE,
}

impl SymbolSession {
    /// # Safety
    ///
    /// No other DbgHelp session may be active
    pub(super) unsafe fn initialize() -> Option<Self> {
        unsafe {
            let process = GetCurrentProcess();

            dbg::SymSetOptions(
                dbg::SYMOPT_LOAD_LINES | dbg::SYMOPT_UNDNAME | dbg::SYMOPT_DEFERRED_LOADS,
            );

            if dbg::SymInitialize(process, ptr::null(), 1) == 0 {
                return None;
            }

            Some(Self { process })
        }
    }

    /// Creates a walker for the current thread, starting at the context of the
    /// exception
    ///
    /// # Safety
    ///
    /// The exception pointers must be valid, and must have been captured on the
    /// current thread
    pub(super) unsafe fn walker(
        &self,
        pointers: *const crash_context::EXCEPTION_POINTERS,
    ) -> StackWalker<'_> {
        unsafe {
            // StackWalk64 modifies the context, so walk a copy
            let context = ptr::read((*pointers).ContextRecord.cast::<dbg::CONTEXT>());

            let mut frame: dbg::STACKFRAME64 = mem::zeroed();

            let (machine, pc, fp, sp) = registers(&context);
            frame.AddrPC.Offset = pc;
            frame.AddrPC.Mode = dbg::AddrModeFlat;
            frame.AddrFrame.Offset = fp;
            frame.AddrFrame.Mode = dbg::AddrModeFlat;
            frame.AddrStack.Offset = sp;
            frame.AddrStack.Mode = dbg::AddrModeFlat;

            StackWalker {
                session: self,
                thread: GetCurrentThread(),
                machine,
                context,
                frame,
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn registers(context: &dbg::CONTEXT) -> (u32, u64, u64, u64) {
    // We define the machine types ourselves rather than pull in the
    // SystemInformation feature just for them
    const IMAGE_FILE_MACHINE_AMD64: u32 = 0x8664;

    (
        IMAGE_FILE_MACHINE_AMD64,
        context.Rip,
        context.Rbp,
        context.Rsp,
    )
}

#[cfg(target_arch = "x86")]
#[inline]
fn registers(context: &dbg::CONTEXT) -> (u32, u64, u64, u64) {
    const IMAGE_FILE_MACHINE_I386: u32 = 0x014c;

    (
        IMAGE_FILE_MACHINE_I386,
        context.Eip as u64,
        context.Ebp as u64,
        context.Esp as u64,
    )
}

#[cfg(target_arch = "aarch64")]
#[inline]
fn registers(context: &dbg::CONTEXT) -> (u32, u64, u64, u64) {
    const IMAGE_FILE_MACHINE_ARM64: u32 = 0xaa64;

    // SAFETY: both union variants are the same general purpose registers
    let fp = unsafe { context.Anonymous.Anonymous.Fp };
    (IMAGE_FILE_MACHINE_ARM64, context.Pc, fp, context.Sp)
}

impl Drop for SymbolSession {
    fn drop(&mut self) {
        // SAFETY: syscall
        unsafe {
            dbg::SymCleanup(self.process);
        }
    }
}

impl SymbolResolver for SymbolSession {
    fn symbol(&self, pc: u64) -> Result<String, ResolveError> {
        #[repr(C)]
        struct SymbolBuffer {
            info: dbg::SYMBOL_INFO,
            name: [u8; MAX_SYM_NAME],
        }

        // SAFETY: syscalls, the name is read within the bounds of the buffer
        unsafe {
            let mut buffer: SymbolBuffer = mem::zeroed();
            buffer.info.SizeOfStruct = mem::size_of::<dbg::SYMBOL_INFO>() as u32;
            buffer.info.MaxNameLen = MAX_SYM_NAME as u32;

            let mut displacement = 0u64;
            if dbg::SymFromAddr(self.process, pc, &mut displacement, &mut buffer.info) == 0 {
                return Err(match GetLastError() {
                    ERROR_MOD_NOT_FOUND | ERROR_INVALID_ADDRESS => ResolveError::NotFound(pc),
                    code => ResolveError::Engine(code),
                });
            }

            let len = (buffer.info.NameLen as usize).min(MAX_SYM_NAME);
            let name = std::slice::from_raw_parts(
                ptr::addr_of!(buffer.info.Name).cast::<u8>(),
                len,
            );

            Ok(String::from_utf8_lossy(name).into_owned())
        }
    }

    fn location(&self, pc: u64) -> Result<(String, u32), ResolveError> {
        // SAFETY: syscalls
        unsafe {
            let mut line: dbg::IMAGEHLP_LINE64 = mem::zeroed();
            line.SizeOfStruct = mem::size_of::<dbg::IMAGEHLP_LINE64>() as u32;

            let mut displacement = 0u32;
            if dbg::SymGetLineFromAddr64(self.process, pc, &mut displacement, &mut line) == 0
                || line.FileName.is_null()
            {
                return Err(ResolveError::NoLineInfo(pc));
            }

            let file = CStr::from_ptr(line.FileName.cast()).to_string_lossy().into_owned();
            Ok((file, line.LineNumber))
        }
    }
}

/// Walks the stack of the current thread with `StackWalk64`
pub(super) struct StackWalker<'session> {
    session: &'session SymbolSession,
    thread: HANDLE,
    machine: u32,
    context: dbg::CONTEXT,
    frame: dbg::STACKFRAME64,
}

impl FrameWalker for StackWalker<'_> {
    fn step(&mut self) -> Option<u64> {
        // SAFETY: syscall, the context and frame are owned by us
        let walked = unsafe {
            dbg::StackWalk64(
                self.machine,
                self.session.process,
                self.thread,
                &mut self.frame,
                (&mut self.context as *mut dbg::CONTEXT).cast(),
                None,
                Some(dbg::SymFunctionTableAccess64),
                Some(dbg::SymGetModuleBase64),
                None,
            )
        };

        (walked != 0).then_some(self.frame.AddrPC.Offset)
    }
}
