//! Error kinds for the unwinder, per the error-handling design in the spec.
//!
//! Each kind maps to one family in the source `thiserror`-style corpus: decode
//! errors from malformed expressions, dependency errors from missing debug
//! sections, evaluation errors from the DWARF VM itself, cross-frame errors
//! from the call-site resolver, and fatal errors that re-raise the signal.

use thiserror::Error;

/// Failure decoding a raw DWARF expression into operations.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed LEB128 operand")]
    BadLeb128,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("expression truncated while reading operand for 0x{0:02x}")]
    Truncated(u8),
}

/// An opcode the table recognizes but does not evaluate.
#[derive(Debug, Error)]
#[error("opcode {0} has no evaluator")]
pub struct UnsupportedOp(pub &'static str);

/// Missing debug information that a resolver needed.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("no CFI found for module containing pc {0:#x}")]
    NoCfi(u64),
    #[error("no DIE found for pc {0:#x}")]
    NoDie(u64),
    #[error("no line table entry for pc {0:#x}")]
    NoLine(u64),
    #[error("no module contains pc {0:#x}")]
    NoModule(u64),
}

/// Malformed Call Frame Information: a CIE/FDE header or instruction stream
/// that doesn't parse. Distinct from [`DependencyError::NoCfi`], which means
/// "no CFI record covers this pc" rather than "the record was garbage."
#[derive(Debug, Error)]
pub enum CfiError {
    #[error("CFI record truncated while reading {0}")]
    Truncated(&'static str),
    #[error("unsupported CIE version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed LEB128 in call frame instruction stream")]
    BadLeb128,
    #[error("unknown call frame instruction opcode 0x{0:02x}")]
    UnknownInstruction(u8),
    #[error("unknown pointer encoding 0x{0:02x}")]
    UnknownEncoding(u8),
    #[error("FDE referenced a CIE that was not found at offset {0}")]
    DanglingCiePointer(usize),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Failure while driving the DWARF expression VM.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("stack underflow, needed {needed} value(s), had {had}")]
    Underflow { needed: usize, had: usize },
    #[error("type mismatch evaluating {op}")]
    TypeMismatch { op: &'static str },
    #[error("division by zero")]
    DivideByZero,
    #[error("memory read of {len} byte(s) at {addr:#x} failed: outside mapped range")]
    BadMemoryRead { addr: u64, len: u8 },
    #[error("failed to read register {0}")]
    BadRegisterRead(u16),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedOp),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    CrossFrame(#[from] CrossFrameError),
    #[error("result left a bare location description with no context to dereference it")]
    DanglingLocation,
    #[error("abs() of the minimum signed value is undefined")]
    AbsOverflow,
}

/// Failure resolving `DW_OP_entry_value` / `DW_OP_GNU_entry_value` against a caller's
/// recorded call-site parameters.
#[derive(Debug, Error)]
pub enum CrossFrameError {
    #[error("entry_value evaluated outside any caller activation")]
    NoParentActivation,
    #[error("no call-site record found in caller for this callee")]
    CallSiteLookupMiss,
    #[error("no call-site parameter location matched the entry_value sub-expression")]
    SubExpressionMismatch,
}

/// Top-level error returned by the handler's rendering entry points.
#[derive(Debug, Error)]
pub enum UnwindError {
    #[error("no stack trace obtained")]
    NoTraceObtained,
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error("a fatal handler was re-entered during unwinding")]
    ReenteredFatalHandler,
}
