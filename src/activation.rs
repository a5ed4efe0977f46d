//! The data model for one stack frame (§3's "Activation") and the parameter
//! records attached to it, plus the glue that lets the DWARF evaluator (C3)
//! read a frame's registers/memory and reach into its parent for
//! `entry_value`.

use core::fmt;

use crate::arch::Registers;
use crate::dwarf::callsite::CallSiteIndex;
use crate::dwarf::die::TypeChain;
use crate::dwarf::expr::Expression;
use crate::dwarf::{EvalContext, ValueContext};
use crate::error::{CrossFrameError, EvalError};

/// Orthogonal flags describing one [`Parameter`], mirroring §3's flag list.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ParamFlags(u32);

impl ParamFlags {
    pub const RETURN: ParamFlags = ParamFlags(1 << 0);
    pub const VARIABLE: ParamFlags = ParamFlags(1 << 1);
    pub const HAS_VALUE: ParamFlags = ParamFlags(1 << 2);
    pub const CONST: ParamFlags = ParamFlags(1 << 3);
    pub const UNSPEC: ParamFlags = ParamFlags(1 << 4);

    pub const NONE: ParamFlags = ParamFlags(0);

    pub fn contains(self, other: ParamFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for ParamFlags {
    type Output = ParamFlags;
    fn bitor(self, rhs: ParamFlags) -> ParamFlags {
        ParamFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ParamFlags {
    fn bitor_assign(&mut self, rhs: ParamFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ParamFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: &[(ParamFlags, &str)] = &[
            (Self::RETURN, "RETURN"),
            (Self::VARIABLE, "VARIABLE"),
            (Self::HAS_VALUE, "HAS_VALUE"),
            (Self::CONST, "CONST"),
            (Self::UNSPEC, "UNSPEC"),
        ];
        write!(f, "[")?;
        let mut first = true;
        for (flag, name) in names {
            if self.contains(*flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, "]")
    }
}

/// One formal parameter or local variable, resolved (or not) against a
/// specific activation.
#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: Option<String>,
    pub line: Option<u64>,
    pub type_chain: TypeChain,
    pub flags: ParamFlags,
    pub value: Option<u64>,
    pub location: Option<Expression>,
}

impl Parameter {
    pub fn has_value(&self) -> bool {
        self.flags.contains(ParamFlags::HAS_VALUE)
    }

    pub fn is_unspecified(&self) -> bool {
        self.flags.contains(ParamFlags::UNSPEC)
    }
}

/// One concrete invocation present on the stack at fault time. Activations
/// live in an arena `Vec` owned by the [`crate::handler::Handler`]; `parent`
/// is an index into that arena rather than a pointer, per the REDESIGN FLAGS.
#[derive(Debug)]
pub struct Activation {
    pub pc: u64,
    pub sp: u64,
    pub cfa: Option<u64>,
    pub frame_base: Option<u64>,
    pub return_register: Option<u16>,
    pub module_bias: u64,
    pub low_pc: Option<u64>,
    pub high_pc: Option<u64>,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub name: Option<String>,
    pub return_type: TypeChain,
    pub parameters: Vec<Parameter>,
    pub call_sites: CallSiteIndex,
    pub parent: Option<usize>,
    pub registers: Registers,
}

impl Activation {
    pub fn new(pc: u64, sp: u64, registers: Registers) -> Self {
        Activation {
            pc,
            sp,
            cfa: None,
            frame_base: None,
            return_register: None,
            module_bias: 0,
            low_pc: None,
            high_pc: None,
            file: None,
            line: None,
            name: None,
            return_type: TypeChain::default(),
            parameters: Vec::new(),
            call_sites: CallSiteIndex::new(),
            parent: None,
            registers,
        }
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// The callee's statically-known entry address, for matching a caller's
    /// call-site index by target (§4.4 step 2).
    pub fn entry_address(&self) -> Option<u64> {
        self.low_pc.map(|low| self.module_bias.wrapping_add(low))
    }
}

/// Adapts one [`Activation`] plus the arena it lives in into the
/// [`EvalContext`] the DWARF evaluator (C3) needs: register/memory reads
/// against this frame, and cross-frame `entry_value` resolution against the
/// parent frame's call-site index (C5).
pub struct ActivationContext<'a> {
    pub arena: &'a [Activation],
    pub index: usize,
}

impl<'a> ActivationContext<'a> {
    pub fn new(arena: &'a [Activation], index: usize) -> Self {
        ActivationContext { arena, index }
    }

    fn this(&self) -> &'a Activation {
        &self.arena[self.index]
    }
}

impl<'a> ValueContext for ActivationContext<'a> {
    fn read_register(&self, dwarf_regno: u16) -> Option<u64> {
        self.this().registers.get(dwarf_regno)
    }

    fn read_memory(&self, addr: u64, len: u8) -> Option<u64> {
        // SAFETY: post-mortem introspection of the crashed process's own
        // memory; unchecked per §5, guarded only by the signal handler's
        // re-entrancy flag (a second fault here re-raises with default
        // disposition instead of recursing).
        unsafe { read_memory_unchecked(addr, len) }
    }
}

impl<'a> EvalContext for ActivationContext<'a> {
    fn cfa(&self) -> Option<u64> {
        self.this().cfa
    }

    fn frame_base(&self) -> Option<u64> {
        self.this().frame_base.or_else(|| self.cfa())
    }

    fn entry_value(&self, sub_expr: &Expression) -> Result<u64, EvalError> {
        let callee = self.this();
        let parent_idx = callee.parent.ok_or(CrossFrameError::NoParentActivation)?;
        let parent = &self.arena[parent_idx];
        let site = parent
            .call_sites
            .find(callee.entry_address(), callee.name.as_deref())
            .ok_or(CrossFrameError::CallSiteLookupMiss)?;
        let param = site.find_param(sub_expr).ok_or(CrossFrameError::SubExpressionMismatch)?;
        param.value.ok_or(CrossFrameError::SubExpressionMismatch.into())
    }
}

/// Reads `len` (1/2/4/8) bytes at `addr` in this process's own address
/// space, zero-extended to 64 bits.
///
/// # Safety
/// `addr` is not validated against any mapping; the caller is relying on the
/// fact that an invalid read here simply re-faults, which the signal shim's
/// re-entrancy guard turns into a clean process termination rather than an
/// infinite loop.
pub(crate) unsafe fn read_memory_unchecked(addr: u64, len: u8) -> Option<u64> {
    if addr == 0 {
        return None;
    }
    match len {
        1 => Some(core::ptr::read_unaligned(addr as *const u8) as u64),
        2 => Some(core::ptr::read_unaligned(addr as *const u16) as u64),
        4 => Some(core::ptr::read_unaligned(addr as *const u32) as u64),
        8 => Some(core::ptr::read_unaligned(addr as *const u64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::callsite::{CallSite, CallSiteParam};

    fn make_activation(pc: u64, cfa: Option<u64>) -> Activation {
        let mut a = Activation::new(pc, 0, Registers::new());
        a.cfa = cfa;
        a
    }

    #[test]
    fn entry_value_reaches_into_parent_call_site() {
        let mut arena = vec![make_activation(0x2000, Some(0x1000)), make_activation(0x1000, Some(0x2000))];
        arena[1].call_sites.insert(CallSite {
            target: Some(0x2000),
            origin: None,
            tail_call: false,
            params: vec![CallSiteParam {
                location: Expression::decode(&[0x50 + 5]).unwrap(),
                value: Some(0x11),
            }],
        });
        arena[0].parent = Some(1);
        arena[0].low_pc = Some(0x2000);
        arena[0].module_bias = 0;

        let ctx = ActivationContext::new(&arena, 0);
        let needle = Expression::decode(&[0x50 + 5]).unwrap();
        assert_eq!(ctx.entry_value(&needle).unwrap(), 0x11);
    }

    #[test]
    fn entry_value_without_parent_fails() {
        let arena = vec![make_activation(0x2000, Some(0x1000))];
        let ctx = ActivationContext::new(&arena, 0);
        let needle = Expression::decode(&[0x50 + 5]).unwrap();
        assert!(matches!(
            ctx.entry_value(&needle),
            Err(EvalError::CrossFrame(CrossFrameError::NoParentActivation))
        ));
    }
}
