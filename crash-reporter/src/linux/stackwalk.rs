use crate::unwind::{FrameWalker, ResolveError, SymbolResolver};
use std::{cell::RefCell, ffi::c_void, mem};

const WORD: u64 = mem::size_of::<usize>() as u64;

/// Unwinds the current thread, keeping only the frames from the faulting
/// instruction onwards.
///
/// Returns `None` if the faulting frame was never reached, eg. because the
/// unwind info needed to get through the signal trampoline is missing.
///
/// # Safety
///
/// Must be called on the faulting thread
pub(super) unsafe fn collect_frames(pc: u64, max_frames: usize) -> Option<Vec<u64>> {
    let mut ips = Vec::with_capacity(max_frames);
    let mut found = false;

    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            // Every frame before the faulting one belongs to the signal handler
            let ip = frame.ip() as u64;
            if !found && ip == pc {
                found = true;
            }

            if found {
                ips.push(ip);
            }

            ips.len() < max_frames
        });
    }

    found.then_some(ips)
}

/// Frames already collected by [`collect_frames`]
pub(super) struct Collected(std::vec::IntoIter<u64>);

impl Collected {
    #[inline]
    pub(super) fn new(ips: Vec<u64>) -> Self {
        Self(ips.into_iter())
    }
}

impl FrameWalker for Collected {
    #[inline]
    fn step(&mut self) -> Option<u64> {
        self.0.next()
    }
}

/// Reads memory that may not be mapped
pub(super) trait ReadMemory {
    fn read_word(&self, addr: u64) -> Option<u64>;
}

/// Reads our own memory with `process_vm_readv`, which fails with `EFAULT`
/// for unmapped addresses instead of faulting
pub(super) struct ProcessMemory;

impl ReadMemory for ProcessMemory {
    fn read_word(&self, addr: u64) -> Option<u64> {
        let mut word = 0usize;

        let local = libc::iovec {
            iov_base: (&mut word as *mut usize).cast(),
            iov_len: WORD as usize,
        };
        let remote = libc::iovec {
            iov_base: addr as usize as *mut c_void,
            iov_len: WORD as usize,
        };

        // SAFETY: syscall, the local buffer is valid for the length given
        let read = unsafe {
            libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0)
        };

        (read == WORD as isize).then_some(word as u64)
    }
}

/// Walks the chain of frame records, `[fp]` holding the caller's frame
/// pointer and `[fp + word]` the return address.
///
/// Only reliable if the code was compiled with frame pointers, the walk
/// stops as soon as the chain looks corrupt.
pub(super) struct FramePointerWalker<M> {
    pc: Option<u64>,
    fp: u64,
    sp: u64,
    memory: M,
}

impl<M: ReadMemory> FramePointerWalker<M> {
    pub(super) fn new(pc: u64, fp: u64, sp: u64, memory: M) -> Self {
        Self {
            pc: Some(pc),
            fp,
            sp,
            memory,
        }
    }
}

impl<M: ReadMemory> FrameWalker for FramePointerWalker<M> {
    fn step(&mut self) -> Option<u64> {
        if let Some(pc) = self.pc.take() {
            return Some(pc);
        }

        let fp = self.fp;
        if fp == 0 || fp % WORD != 0 || fp < self.sp {
            return None;
        }

        let caller_fp = self.memory.read_word(fp)?;
        let return_address = self.memory.read_word(fp + WORD)?;

        // The stack grows down, so the caller's record must be above ours
        if caller_fp != 0 && caller_fp <= fp {
            self.fp = 0;
        } else {
            self.fp = caller_fp;
        }
        self.sp = fp + 2 * WORD;

        Some(return_address)
    }
}

/// The last resolved address
struct Resolved {
    addr: u64,
    name: Option<String>,
    location: Option<(String, u32)>,
}

/// Resolves symbols with the debug info of the loaded modules.
///
/// The parsed debug info is cached by `backtrace` for the lifetime of the
/// process, it is released when the resolver is dropped.
pub(super) struct Resolver {
    last: RefCell<Option<Resolved>>,
}

impl Resolver {
    #[inline]
    pub(super) fn new() -> Self {
        Self {
            last: RefCell::new(None),
        }
    }

    fn resolve<T>(&self, addr: u64, f: impl FnOnce(&Resolved) -> T) -> T {
        let mut last = self.last.borrow_mut();

        if let Some(resolved) = last.as_ref().filter(|r| r.addr == addr) {
            return f(resolved);
        }

        let mut resolved = Resolved {
            addr,
            name: None,
            location: None,
        };

        // `resolve` treats the address as a return address and looks up the
        // byte before it, the lookup address has already been adjusted
        let lookup = (addr as usize).wrapping_add(1) as *mut c_void;

        // SAFETY: only called from the faulting thread, other threads are not
        // using the symbolizer
        unsafe {
            backtrace::resolve_unsynchronized(lookup, |symbol| {
                if resolved.name.is_none() {
                    resolved.name = symbol.name().map(|name| format!("{name:#}"));
                }

                if resolved.location.is_none() {
                    if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                        resolved.location = Some((file.display().to_string(), line));
                    }
                }
            });
        }

        f(last.insert(resolved))
    }
}

impl SymbolResolver for Resolver {
    fn symbol(&self, pc: u64) -> Result<String, ResolveError> {
        self.resolve(pc, |r| r.name.clone().ok_or(ResolveError::NotFound(pc)))
    }

    fn location(&self, pc: u64) -> Result<(String, u32), ResolveError> {
        self.resolve(pc, |r| r.location.clone().ok_or(ResolveError::NoLineInfo(pc)))
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        backtrace::clear_symbol_cache();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::unwind;
    use std::collections::HashMap;

    /// The unsynchronized symbolizer must not be used by tests in parallel
    static SYMBOLIZER: parking_lot::Mutex<()> = parking_lot::const_mutex(());

    struct FakeStack(HashMap<u64, u64>);

    impl ReadMemory for FakeStack {
        fn read_word(&self, addr: u64) -> Option<u64> {
            self.0.get(&addr).copied()
        }
    }

    fn walk(walker: &mut dyn FrameWalker) -> Vec<u64> {
        std::iter::from_fn(|| walker.step()).take(32).collect()
    }

    #[test]
    fn follows_frame_records() {
        let stack = FakeStack(HashMap::from([
            (0x1000, 0x1040),
            (0x1000 + WORD, 0xaaa0),
            (0x1040, 0x1100),
            (0x1040 + WORD, 0xbbb0),
            (0x1100, 0),
            (0x1100 + WORD, 0xccc0),
        ]));

        let mut walker = FramePointerWalker::new(0x9990, 0x1000, 0x0ff0, stack);
        assert_eq!(walk(&mut walker), [0x9990, 0xaaa0, 0xbbb0, 0xccc0]);
    }

    #[test]
    fn stops_on_corrupt_chain() {
        // The caller's record points back down the stack
        let stack = FakeStack(HashMap::from([
            (0x1000, 0x0800),
            (0x1000 + WORD, 0xaaa0),
            (0x0800, 0x1000),
            (0x0800 + WORD, 0xbbb0),
        ]));

        let mut walker = FramePointerWalker::new(0x9990, 0x1000, 0x0ff0, stack);
        assert_eq!(walk(&mut walker), [0x9990, 0xaaa0]);

        // Misaligned
        let mut walker = FramePointerWalker::new(0x9990, 0x1003, 0x0ff0, FakeStack(HashMap::new()));
        assert_eq!(walk(&mut walker), [0x9990]);

        // Unreadable
        let mut walker = FramePointerWalker::new(0x9990, 0x1000, 0x0ff0, FakeStack(HashMap::new()));
        assert_eq!(walk(&mut walker), [0x9990]);
    }

    #[test]
    fn reads_own_memory() {
        let value: usize = 0x1234_5678;
        let addr = &value as *const usize as u64;

        assert_eq!(ProcessMemory.read_word(addr), Some(0x1234_5678));
        assert_eq!(ProcessMemory.read_word(0), None);
    }

    #[inline(never)]
    fn marker() -> u64 {
        marker as usize as u64
    }

    #[test]
    fn resolves_own_symbols() {
        let _lock = SYMBOLIZER.lock();
        let resolver = Resolver::new();
        let addr = marker();

        let name = resolver.symbol(addr).unwrap();
        assert!(name.ends_with("marker"), "{name}");

        assert_eq!(resolver.symbol(0), Err(ResolveError::NotFound(0)));
        assert!(resolver.location(0).is_err());
    }

    #[test]
    fn unwinds_collected_frames() {
        let _lock = SYMBOLIZER.lock();
        let frames = unwind::unwind(
            &mut Collected::new(vec![marker(), 0]),
            &Resolver::new(),
            10,
        );

        assert_eq!(frames.len(), 1);
        assert!(frames[0].symbol_name().ends_with("marker"));
    }
}
