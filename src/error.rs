use std::fmt;

use crate::remote_ptr::RemoteCodePtr;

/// The error taxonomy for the driver, matching the fatal/recoverable split
/// the original tool draws between environment failures, translation
/// failures, tracee death, tool-detected taint violations and outright
/// invariant violations.
#[derive(Debug)]
pub enum Error {
    /// Opening `/proc/<pid>/mem`, `ptrace(TRACEME)`, `execve`, or any other
    /// call required just to get a tracee running, failed.
    Fatal(String),
    /// The decoder returned `bad` on in-flight bytes; the translation
    /// request that produced them must be abandoned.
    TranslationFailure { addr: u64, reason: String },
    /// The tracee terminated in a way the driver wasn't prepared for.
    TraceeDied { tid: libc::pid_t, reason: String },
    /// A tool-detected taint violation (tainted syscall arg, tainted
    /// branch, tainted memory access, tainted register read).
    Violation { at: RemoteCodePtr, what: String },
    /// An internal invariant was violated (mismatched snapshot key sets,
    /// unregistered breakpoint address, misplaced ModR/M byte, ...).
    InvariantViolation(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fatal(msg) => write!(f, "fatal: {}", msg),
            Error::TranslationFailure { addr, reason } => {
                write!(f, "translation failed at {:#x}: {}", addr, reason)
            }
            Error::TraceeDied { tid, reason } => {
                write!(f, "tracee {} died: {}", tid, reason)
            }
            Error::Violation { at, what } => {
                write!(f, "taint violation at {}: {}", at, what)
            }
            Error::InvariantViolation(msg) => write!(f, "invariant violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Error {
        Error::Fatal(format!("{}", e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Fatal(format!("{}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether a tool-detected violation should abort the run, warn and
/// continue, or be silently stubbed out. See spec.md §7.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(dead_code)]
pub enum ViolationPolicy {
    Abort,
    Warn,
    Stub,
}
