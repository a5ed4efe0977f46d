//! The DWARF expression virtual machine and the frame/parameter resolvers
//! built on top of it — the hard core of this crate.
//!
//! Submodules, leaves first:
//! - [`value`] (C2): the typed operand stack.
//! - [`expr`] (C1): opcode decoding into a structurally-comparable [`expr::Expression`].
//! - [`eval`] (C3): drives [`value::Stack`] through an [`expr::Expression`].
//! - [`cfi`] (C4 support): CIE/FDE parsing and call-frame row materialization.
//! - [`callsite`] (C5): the call-site parameter index `entry_value` reaches into.
//! - [`die`] (C6 support): walks `.debug_info` for functions, parameters, and call sites.
//!
//! Frame resolution (C4 proper), the parameter resolver (C6), and the
//! handler/orchestrator (C7) live one level up, in [`crate::activation`] and
//! [`crate::handler`], since they also depend on [`crate::module`] (C10) and
//! the frame cursor (C9) in [`crate::cursor`].

pub mod callsite;
pub mod cfi;
pub mod cfi_lookup;
pub mod die;
pub mod eval;
pub mod expr;
pub mod value;

pub use eval::{EvalContext, Evaluator};
pub use expr::Expression;
pub use value::{Stack, TypeFlags, TypedValue, ValueContext};
