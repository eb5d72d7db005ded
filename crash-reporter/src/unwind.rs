//! Platform agnostic stack walking.
//!
//! A platform provides a [`FrameWalker`], which advances a cursor one frame at
//! a time from the captured register state, and a [`SymbolResolver`] which
//! maps the resulting addresses to names and source locations. [`unwind`]
//! drives both and caps the walk.

use std::fmt;

/// Placeholder rendered for frames whose symbol could not be resolved
pub const SYMBOL_NOT_FOUND: &str = "(symbol not found)";

/// The reason a symbol or line lookup failed
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No symbol covers the address
    #[error("no symbol found for address {0:#x}")]
    NotFound(u64),
    /// The symbol was found, but there is no line information for it
    #[error("no line information for address {0:#x}")]
    NoLineInfo(u64),
    /// The symbol engine itself reported an error
    #[error("symbol engine error {0}")]
    Engine(u32),
}

/// A resolved source location
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    /// The file, shortened by [`shorten_path`]
    pub file: String,
    pub line: u32,
}

/// A single frame of the faulting thread's stack
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    /// 0-based depth, 0 being the frame that faulted
    pub depth: usize,
    /// The program counter of the frame
    pub pc: u64,
    pub symbol: Result<String, ResolveError>,
    pub location: Result<SourceLocation, ResolveError>,
}

impl StackFrame {
    /// The resolved symbol name, or [`SYMBOL_NOT_FOUND`]
    #[inline]
    pub fn symbol_name(&self) -> &str {
        self.symbol.as_deref().unwrap_or(SYMBOL_NOT_FOUND)
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  {}: {}", self.depth, self.symbol_name())?;

        if let Ok(loc) = &self.location {
            write!(f, "\n        file: {}\n        line: {}", loc.file, loc.line)?;
        }

        write!(f, " [{:#x}]", self.pc)
    }
}

/// Advances a virtual cursor over the frames of a captured thread context
pub trait FrameWalker {
    /// Moves to the next frame, returning its program counter, or `None` if
    /// the platform primitive failed to advance.
    ///
    /// The first call returns the frame the context was captured at.
    fn step(&mut self) -> Option<u64>;
}

/// Maps code addresses to symbols.
///
/// Implementations are expected to hold the symbol engine for as long as
/// they live, releasing it when dropped.
pub trait SymbolResolver {
    /// The demangled name of the function containing `pc`
    fn symbol(&self, pc: u64) -> Result<String, ResolveError>;
    /// The source location of `pc`, with the file name not yet shortened
    fn location(&self, pc: u64) -> Result<(String, u32), ResolveError>;
}

/// The address to use for symbol lookups of the frame at `depth`.
///
/// Only the innermost frame's pc is the faulting instruction, every frame
/// above it is a return address that points just past the call.
#[inline]
pub fn lookup_address(depth: usize, pc: u64) -> u64 {
    if depth == 0 { pc } else { pc.saturating_sub(1) }
}

/// Walks at most `max_frames` frames.
///
/// The walk ends early when the walker fails or yields a 0 address, the
/// frames gathered up to that point are returned. Resolution failures never
/// end the walk.
pub fn unwind(
    walker: &mut dyn FrameWalker,
    resolver: &dyn SymbolResolver,
    max_frames: usize,
) -> Vec<StackFrame> {
    let mut frames = Vec::with_capacity(max_frames);

    for depth in 0..max_frames {
        let Some(pc) = walker.step() else {
            log::debug!("stack walk stopped after {depth} frames");
            break;
        };

        if pc == 0 {
            break;
        }

        let addr = lookup_address(depth, pc);
        let symbol = resolver.symbol(addr);
        let location = resolver.location(addr).map(|(file, line)| SourceLocation {
            file: shorten_path(&file).to_owned(),
            line,
        });

        frames.push(StackFrame {
            depth,
            pc,
            symbol,
            location,
        });
    }

    frames
}

/// Shortens a source path to its last two segments, eg.
/// `/build/machine/src/thing/lib.rs` becomes `thing/lib.rs`
pub fn shorten_path(path: &str) -> &str {
    let is_sep = |c: char| c == '/' || c == '\\';

    let Some(last) = path.rfind(is_sep) else {
        return path;
    };

    match path[..last].rfind(is_sep) {
        Some(second) => &path[second + 1..],
        None => path,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Yields the provided pcs, then fails
    struct Scripted(std::vec::IntoIter<u64>);

    impl Scripted {
        fn new(pcs: Vec<u64>) -> Self {
            Self(pcs.into_iter())
        }
    }

    impl FrameWalker for Scripted {
        fn step(&mut self) -> Option<u64> {
            self.0.next()
        }
    }

    /// Infinite recursion, every step succeeds
    struct Bottomless(u64);

    impl FrameWalker for Bottomless {
        fn step(&mut self) -> Option<u64> {
            self.0 += 0x10;
            Some(self.0)
        }
    }

    /// Resolves every address except the ones in `missing`, and provides line
    /// info only for even addresses
    struct Table {
        missing: Vec<u64>,
    }

    impl SymbolResolver for Table {
        fn symbol(&self, pc: u64) -> Result<String, ResolveError> {
            if self.missing.contains(&pc) {
                Err(ResolveError::NotFound(pc))
            } else {
                Ok(format!("fn_{pc:x}"))
            }
        }

        fn location(&self, pc: u64) -> Result<(String, u32), ResolveError> {
            if pc % 2 == 0 {
                Ok((format!("/home/builder/proj/src/fn_{pc:x}.rs"), pc as u32))
            } else {
                Err(ResolveError::NoLineInfo(pc))
            }
        }
    }

    #[test]
    fn capped_at_max() {
        let frames = unwind(&mut Bottomless(0), &Table { missing: vec![] }, 10);
        assert_eq!(frames.len(), 10);
        assert_eq!(frames.last().unwrap().depth, 9);
    }

    #[test]
    fn stops_at_zero() {
        let frames = unwind(
            &mut Scripted::new(vec![0x1000, 0x2001, 0x3001, 0, 0x5000]),
            &Table { missing: vec![] },
            10,
        );
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn stops_on_walk_failure() {
        let frames = unwind(&mut Scripted::new(vec![0x1000]), &Table { missing: vec![] }, 10);
        assert_eq!(frames.len(), 1);

        let frames = unwind(&mut Scripted::new(Vec::new()), &Table { missing: vec![] }, 10);
        assert!(frames.is_empty());
    }

    #[test]
    fn symbol_failure_is_not_fatal() {
        // The lookup address of non-innermost frames is pc - 1
        let frames = unwind(
            &mut Scripted::new(vec![0x1000, 0x2001, 0x3001]),
            &Table {
                missing: vec![0x2000],
            },
            10,
        );

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].symbol_name(), "fn_1000");
        assert_eq!(frames[1].symbol, Err(ResolveError::NotFound(0x2000)));
        assert_eq!(frames[1].symbol_name(), SYMBOL_NOT_FOUND);
        assert_eq!(frames[2].symbol_name(), "fn_3000");
    }

    #[test]
    fn lines_are_independent_of_symbols() {
        let frames = unwind(
            &mut Scripted::new(vec![0x1000, 0x2002]),
            &Table {
                missing: vec![0x1000],
            },
            10,
        );

        assert_eq!(frames[0].symbol_name(), SYMBOL_NOT_FOUND);
        assert_eq!(
            frames[0].location,
            Ok(SourceLocation {
                file: "src/fn_1000.rs".to_owned(),
                line: 0x1000,
            })
        );
        // 0x2002 - 1 is odd
        assert_eq!(frames[1].symbol_name(), "fn_2001");
        assert!(frames[1].location.is_err());
    }

    #[test]
    fn renders() {
        let frame = StackFrame {
            depth: 2,
            pc: 0x7ff6_1234,
            symbol: Ok("game::update".to_owned()),
            location: Ok(SourceLocation {
                file: "src/game.rs".to_owned(),
                line: 42,
            }),
        };
        assert_eq!(
            frame.to_string(),
            "  2: game::update\n        file: src/game.rs\n        line: 42 [0x7ff61234]"
        );

        let frame = StackFrame {
            depth: 0,
            pc: 0x10,
            symbol: Err(ResolveError::NotFound(0x10)),
            location: Err(ResolveError::NoLineInfo(0x10)),
        };
        assert_eq!(frame.to_string(), "  0: (symbol not found) [0x10]");
    }

    #[test]
    fn shortens_paths() {
        assert_eq!(shorten_path("/a/b/c/d.rs"), "c/d.rs");
        assert_eq!(shorten_path(r"C:\build\src\engine\render.cpp"), r"engine\render.cpp");
        assert_eq!(shorten_path("src/lib.rs"), "src/lib.rs");
        assert_eq!(shorten_path("lib.rs"), "lib.rs");
        assert_eq!(shorten_path("/lib.rs"), "/lib.rs");
    }
}
