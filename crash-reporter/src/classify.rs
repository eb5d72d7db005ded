//! Maps raw fault codes to a human readable diagnosis.
//!
//! Codes are the NT status values used by structured exceptions. The signal
//! based platform translates its signals into the same values before
//! classification, so a single table serves every platform.

use std::fmt;

/// The fault codes understood by [`classify`]
pub mod codes {
    pub const ACCESS_VIOLATION: u32 = 0xC000_0005;
    pub const IN_PAGE_ERROR: u32 = 0xC000_0006;
    pub const ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
    pub const NONCONTINUABLE_EXCEPTION: u32 = 0xC000_0025;
    pub const INT_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
    pub const PRIV_INSTRUCTION: u32 = 0xC000_0096;
    pub const STACK_OVERFLOW: u32 = 0xC000_00FD;
    pub const GUARD_PAGE: u32 = 0x8000_0001;
    pub const BREAKPOINT: u32 = 0x8000_0003;
    /// `STATUS_FATAL_APP_EXIT`, used by crashpad to report `abort()`
    pub const ABORT: u32 = 0x4000_0015;
}

/// The category of a fault
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    AccessViolation,
    StackOverflow,
    IllegalInstruction,
    IntDivideByZero,
    Breakpoint,
    GuardPage,
    PrivilegedInstruction,
    NonContinuable,
    InPageError,
    Abort,
    /// A code not present in the table, the raw value is kept for the report
    Unknown(u32),
}

impl FaultKind {
    pub fn from_code(code: u32) -> Self {
        match code {
            codes::ACCESS_VIOLATION => Self::AccessViolation,
            codes::STACK_OVERFLOW => Self::StackOverflow,
            codes::ILLEGAL_INSTRUCTION => Self::IllegalInstruction,
            codes::INT_DIVIDE_BY_ZERO => Self::IntDivideByZero,
            codes::BREAKPOINT => Self::Breakpoint,
            codes::GUARD_PAGE => Self::GuardPage,
            codes::PRIV_INSTRUCTION => Self::PrivilegedInstruction,
            codes::NONCONTINUABLE_EXCEPTION => Self::NonContinuable,
            codes::IN_PAGE_ERROR => Self::InPageError,
            codes::ABORT => Self::Abort,
            other => Self::Unknown(other),
        }
    }

    /// The fixed message for the kind. Access violations and unknown codes
    /// carry extra detail and are rendered by [`Classification`] instead.
    pub fn message(self) -> Option<&'static str> {
        Some(match self {
            Self::StackOverflow => "Stack overflow (likely due to infinite recursion)",
            Self::IllegalInstruction => "Illegal CPU instruction executed",
            Self::IntDivideByZero => "Integer divide by zero",
            Self::Breakpoint => "Breakpoint hit (INT 3 instruction executed)",
            Self::GuardPage => {
                "Guard page accessed (likely stack guard or memory protection violation)"
            }
            Self::PrivilegedInstruction => "Privileged instruction executed in user mode",
            Self::NonContinuable => {
                "Attempted to continue after a non-continuable exception (fatal logic error)"
            }
            Self::InPageError => "Memory access failed (I/O or paging failure)",
            Self::Abort => "Abnormal program termination (abort was called)",
            Self::AccessViolation | Self::Unknown(_) => return None,
        })
    }
}

/// The kind of memory access that caused an access violation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
    Unknown(u64),
}

impl AccessKind {
    /// Converts the first access violation parameter of an exception record
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            0 => Self::Read,
            1 => Self::Write,
            8 => Self::Execute,
            other => Self::Unknown(other),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Read => "read from",
            Self::Write => "write to",
            Self::Execute => "execute",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// The data access of a memory access violation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryAccess {
    pub kind: AccessKind,
    /// The address that was accessed
    pub address: u64,
}

/// The diagnosis of a single fault
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub kind: FaultKind,
    /// Only present for access violations
    pub access: Option<MemoryAccess>,
}

impl Classification {
    #[inline]
    pub fn is_access_violation(&self) -> bool {
        self.kind == FaultKind::AccessViolation
    }

    /// The reason line, without the `Reason: ` prefix
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(msg) = self.kind.message() {
            return f.write_str(msg);
        }

        match (self.kind, self.access) {
            (FaultKind::Unknown(code), _) => write!(f, "Unknown exception (code: {code:#x})"),
            (_, Some(access)) => {
                match access.kind {
                    AccessKind::Unknown(_) => write!(
                        f,
                        "Access violation - {} access to invalid memory at address {:#x}",
                        access.kind.describe(),
                        access.address
                    )?,
                    kind => write!(
                        f,
                        "Access violation - attempted to {} invalid memory at address {:#x}",
                        kind.describe(),
                        access.address
                    )?,
                }

                if access.kind == AccessKind::Execute {
                    f.write_str(" (possible code execution or exploit attempt)")?;
                }

                Ok(())
            }
            (_, None) => f.write_str("Access violation - attempted to access invalid memory"),
        }
    }
}

/// Classifies the fault `code`.
///
/// `access` is only kept for access violations, so that the extra detail is
/// never rendered for another kind of fault.
pub fn classify(code: u32, access: Option<MemoryAccess>) -> Classification {
    let kind = FaultKind::from_code(code);
    Classification {
        kind,
        access: access.filter(|_| kind == FaultKind::AccessViolation),
    }
}
