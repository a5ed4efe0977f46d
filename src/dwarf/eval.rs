//! The DWARF expression evaluator (C3): drives a [`Stack`] through an
//! [`Expression`]'s operations one opcode at a time.
//!
//! The evaluator loop is opcode-agnostic; all per-opcode behavior lives in
//! [`Evaluator::step`]'s match arms, which is the operation table's evaluate
//! half (C1's decode half lives in `expr.rs`).

use super::expr::{self, Expression, Op};
use super::value::{Stack, TypeFlags, TypedValue, ValueContext};
use crate::error::{EvalError, UnsupportedOp};

/// Environment an [`Evaluator`] needs beyond the bare stack: register and
/// memory reads (via [`ValueContext`]), the frame's CFA and frame base, and a
/// hook back out to the call-site resolver (C5) for `entry_value`.
///
/// `frame_base` is `call_frame_cfa` for every function in this crate's test
/// corpus and the vast majority of real-world DWARF: a `DW_AT_frame_base` of
/// `DW_OP_call_frame_cfa` is what every mainstream compiler emits. Per the
/// documented simplification (§9), `fbreg` evaluates against `cfa()`
/// directly rather than first evaluating a separate `frame_base` expression;
/// a context that needs the general case can still override `frame_base`.
pub trait EvalContext: ValueContext {
    fn cfa(&self) -> Option<u64>;

    fn frame_base(&self) -> Option<u64> {
        self.cfa()
    }

    /// Resolves a `DW_OP_entry_value`/`DW_OP_GNU_entry_value` sub-expression
    /// against the caller's recorded call-site parameters. Implemented by the
    /// handler orchestration layer, which has access to the activation chain
    /// and the call-site index; the evaluator itself knows nothing about
    /// frames beyond this one.
    fn entry_value(&self, sub_expr: &Expression) -> Result<u64, EvalError>;
}

/// §4.2's signedness rule for a two-operand opcode: mixed signed/unsigned
/// (or either operand untagged either way) yields signed; unsigned·unsigned
/// is the only case that stays unsigned.
fn combined_signedness(a: TypedValue, b: TypedValue) -> TypeFlags {
    if a.flags().contains(TypeFlags::SIGNED) || b.flags().contains(TypeFlags::SIGNED) {
        TypeFlags::SIGNED
    } else {
        TypeFlags::UNSIGNED
    }
}

/// Drives one [`Expression`] through a fresh [`Stack`] to completion.
pub struct Evaluator<'a> {
    stack: Stack,
    ctx: &'a dyn EvalContext,
}

impl<'a> Evaluator<'a> {
    pub fn new(ctx: &'a dyn EvalContext) -> Self {
        Evaluator { stack: Stack::new(), ctx }
    }

    /// Evaluates `expr` to completion and extracts the single result value
    /// via [`Stack::result`]'s dereference rule.
    pub fn evaluate(mut self, expr: &Expression) -> Result<u64, EvalError> {
        self.run(expr)?;
        self.stack.result(self.ctx)
    }

    /// Evaluates `expr` but stops short of the final dereference, returning
    /// the raw top-of-stack [`TypedValue`]. The parameter resolver (C6) needs
    /// this form: whether a location is a register or memory address matters
    /// to the caller, not just its dereferenced value.
    pub fn evaluate_location(mut self, expr: &Expression) -> Result<TypedValue, EvalError> {
        self.run(expr)?;
        self.stack.peek(0).ok_or(EvalError::Underflow { needed: 1, had: 0 })
    }

    fn run(&mut self, expr: &Expression) -> Result<(), EvalError> {
        self.stack.clear();
        for op in expr.ops() {
            self.step(op)?;
        }
        Ok(())
    }

    fn binop(&mut self, name: &'static str, f: impl FnOnce(u64, u64) -> u64) -> Result<(), EvalError> {
        self.stack.promote_register_top(self.ctx)?;
        let b = self.stack.pop().ok_or(EvalError::Underflow { needed: 2, had: 0 })?;
        self.stack.promote_register_top(self.ctx)?;
        let a = self.stack.pop().ok_or(EvalError::Underflow { needed: 2, had: 1 })?;
        if a.is_location() || b.is_location() {
            return Err(EvalError::TypeMismatch { op: name });
        }
        let result = f(a.payload(), b.payload());
        self.stack.push_value(TypedValue::new(result, TypeFlags::GENERIC | combined_signedness(a, b)));
        Ok(())
    }

    fn unop(&mut self, name: &'static str, f: impl FnOnce(u64) -> u64) -> Result<(), EvalError> {
        self.stack.promote_register_top(self.ctx)?;
        let a = self.stack.pop().ok_or(EvalError::Underflow { needed: 1, had: 0 })?;
        if a.is_location() {
            return Err(EvalError::TypeMismatch { op: name });
        }
        self.stack.push_value(TypedValue::new(f(a.payload()), TypeFlags::GENERIC));
        Ok(())
    }

    fn step(&mut self, op: &Op) -> Result<(), EvalError> {
        use expr::*;
        match op.code {
            DW_OP_addr => self.stack.push(op.arg1, 8, TypeFlags::MEMORY_LOC),
            DW_OP_lit0..=DW_OP_lit31 => {
                self.stack.push(op.arg1, 8, TypeFlags::GENERIC | TypeFlags::CONST)
            }
            DW_OP_const1u | DW_OP_const2u | DW_OP_const4u | DW_OP_const8u | DW_OP_constu => {
                self.stack.push(op.arg1, 8, TypeFlags::GENERIC | TypeFlags::UNSIGNED)
            }
            DW_OP_const1s | DW_OP_const2s | DW_OP_const4s | DW_OP_const8s | DW_OP_consts => {
                self.stack.push(op.arg1, 8, TypeFlags::GENERIC | TypeFlags::SIGNED)
            }
            DW_OP_reg0..=DW_OP_reg31 => {
                self.stack.push(op.arg1, 8, TypeFlags::REGISTER_LOC)
            }
            DW_OP_regx => self.stack.push(op.arg1, 8, TypeFlags::REGISTER_LOC),
            DW_OP_breg0..=DW_OP_breg31 => {
                let base = self
                    .ctx
                    .read_register(op.arg1 as u16)
                    .ok_or(EvalError::BadRegisterRead(op.arg1 as u16))?;
                let addr = base.wrapping_add(op.arg2);
                self.stack.push(addr, 8, TypeFlags::MEMORY_LOC);
            }
            DW_OP_bregx => {
                let base = self
                    .ctx
                    .read_register(op.arg1 as u16)
                    .ok_or(EvalError::BadRegisterRead(op.arg1 as u16))?;
                let addr = base.wrapping_add(op.arg2);
                self.stack.push(addr, 8, TypeFlags::MEMORY_LOC);
            }
            DW_OP_fbreg => {
                let base = self.ctx.frame_base().ok_or(EvalError::BadRegisterRead(0))?;
                let addr = base.wrapping_add(op.arg1);
                self.stack.push(addr, 8, TypeFlags::MEMORY_LOC);
            }
            DW_OP_call_frame_cfa => {
                let cfa = self.ctx.cfa().ok_or(EvalError::BadRegisterRead(0))?;
                self.stack.push(cfa, 8, TypeFlags::MEMORY_LOC);
            }
            DW_OP_deref => {
                self.stack.promote_register_top(self.ctx)?;
                let top = self.stack.pop().ok_or(EvalError::Underflow { needed: 1, had: 0 })?;
                let value = self
                    .ctx
                    .read_memory(top.payload(), 8)
                    .ok_or(EvalError::BadMemoryRead { addr: top.payload(), len: 8 })?;
                self.stack.push(value, 8, TypeFlags::GENERIC);
            }
            DW_OP_deref_size => {
                self.stack.promote_register_top(self.ctx)?;
                let top = self.stack.pop().ok_or(EvalError::Underflow { needed: 1, had: 0 })?;
                let len = op.arg1 as u8;
                let value = self
                    .ctx
                    .read_memory(top.payload(), len)
                    .ok_or(EvalError::BadMemoryRead { addr: top.payload(), len })?;
                self.stack.push(value, len, TypeFlags::GENERIC);
            }
            DW_OP_dup => {
                let top = self.stack.peek(0).ok_or(EvalError::Underflow { needed: 1, had: 0 })?;
                self.stack.push_value(top);
            }
            DW_OP_drop => {
                self.stack.pop().ok_or(EvalError::Underflow { needed: 1, had: 0 })?;
            }
            DW_OP_over => {
                let v = self.stack.peek(1).ok_or(EvalError::Underflow { needed: 2, had: self.stack.len() })?;
                self.stack.push_value(v);
            }
            DW_OP_pick => {
                let v = self
                    .stack
                    .peek(op.arg1 as usize)
                    .ok_or(EvalError::Underflow { needed: op.arg1 as usize + 1, had: self.stack.len() })?;
                self.stack.push_value(v);
            }
            DW_OP_swap => {
                let a = self.stack.pop().ok_or(EvalError::Underflow { needed: 2, had: 0 })?;
                let b = self.stack.pop().ok_or(EvalError::Underflow { needed: 2, had: 1 })?;
                self.stack.push_value(a);
                self.stack.push_value(b);
            }
            DW_OP_rot => {
                let a = self.stack.pop().ok_or(EvalError::Underflow { needed: 3, had: 0 })?;
                let b = self.stack.pop().ok_or(EvalError::Underflow { needed: 3, had: 1 })?;
                let c = self.stack.pop().ok_or(EvalError::Underflow { needed: 3, had: 2 })?;
                self.stack.push_value(a);
                self.stack.push_value(c);
                self.stack.push_value(b);
            }
            DW_OP_abs => {
                self.stack.promote_register_top(self.ctx)?;
                let a = self.stack.pop().ok_or(EvalError::Underflow { needed: 1, had: 0 })?;
                if a.is_location() {
                    return Err(EvalError::TypeMismatch { op: "abs" });
                }
                let signed = a.payload() as i64;
                if signed == i64::MIN {
                    return Err(EvalError::AbsOverflow);
                }
                self.stack.push_value(TypedValue::new(signed.unsigned_abs(), TypeFlags::GENERIC));
            }
            DW_OP_neg => self.unop("neg", |a| (a as i64).wrapping_neg() as u64)?,
            DW_OP_not => self.unop("not", |a| !a)?,
            DW_OP_and => self.binop("and", |a, b| a & b)?,
            DW_OP_or => self.binop("or", |a, b| a | b)?,
            DW_OP_plus => self.binop("plus", |a, b| a.wrapping_add(b))?,
            DW_OP_minus => self.binop("minus", |a, b| a.wrapping_sub(b))?,
            DW_OP_mul => self.binop("mul", |a, b| a.wrapping_mul(b))?,
            DW_OP_div => {
                self.stack.promote_register_top(self.ctx)?;
                let b = self.stack.pop().ok_or(EvalError::Underflow { needed: 2, had: 0 })?;
                self.stack.promote_register_top(self.ctx)?;
                let a = self.stack.pop().ok_or(EvalError::Underflow { needed: 2, had: 1 })?;
                if b.payload() == 0 {
                    return Err(EvalError::DivideByZero);
                }
                let signedness = combined_signedness(a, b);
                let result = if signedness.contains(TypeFlags::SIGNED) {
                    (a.payload() as i64).wrapping_div(b.payload() as i64) as u64
                } else {
                    a.payload().wrapping_div(b.payload())
                };
                self.stack.push_value(TypedValue::new(result, TypeFlags::GENERIC | signedness));
            }
            DW_OP_mod => {
                self.stack.promote_register_top(self.ctx)?;
                let b = self.stack.pop().ok_or(EvalError::Underflow { needed: 2, had: 0 })?;
                self.stack.promote_register_top(self.ctx)?;
                let a = self.stack.pop().ok_or(EvalError::Underflow { needed: 2, had: 1 })?;
                if b.payload() == 0 {
                    return Err(EvalError::DivideByZero);
                }
                let signedness = combined_signedness(a, b);
                let result = if signedness.contains(TypeFlags::SIGNED) {
                    ((a.payload() as i64) % (b.payload() as i64)) as u64
                } else {
                    a.payload() % b.payload()
                };
                self.stack.push_value(TypedValue::new(result, TypeFlags::GENERIC | signedness));
            }
            DW_OP_plus_uconst => {
                self.stack.promote_register_top(self.ctx)?;
                let top = self.stack.pop().ok_or(EvalError::Underflow { needed: 1, had: 0 })?;
                let flags = if top.is_memory_loc() { TypeFlags::MEMORY_LOC } else { TypeFlags::GENERIC };
                self.stack.push_value(TypedValue::new(top.payload().wrapping_add(op.arg1), flags));
            }
            DW_OP_stack_value => {
                let top = self.stack.pop().ok_or(EvalError::Underflow { needed: 1, had: 0 })?;
                self.stack.push_value(top.as_stack_value());
            }
            DW_OP_nop => {}
            DW_OP_entry_value | DW_OP_GNU_entry_value => {
                let sub = Expression::decode(&op.sub_expr)?;
                let value = self.ctx.entry_value(&sub)?;
                self.stack.push_value(TypedValue::new(value, TypeFlags::GENERIC));
            }
            _ => return Err(EvalError::Unsupported(UnsupportedOp(op.name()))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeFrame {
        regs: HashMap<u16, u64>,
        mem: HashMap<u64, u64>,
        cfa: Option<u64>,
    }

    impl ValueContext for FakeFrame {
        fn read_register(&self, r: u16) -> Option<u64> {
            self.regs.get(&r).copied()
        }
        fn read_memory(&self, addr: u64, _len: u8) -> Option<u64> {
            self.mem.get(&addr).copied()
        }
    }

    impl EvalContext for FakeFrame {
        fn cfa(&self) -> Option<u64> {
            self.cfa
        }
        fn entry_value(&self, _sub: &Expression) -> Result<u64, EvalError> {
            Err(EvalError::CrossFrame(crate::error::CrossFrameError::NoParentActivation))
        }
    }

    fn frame() -> FakeFrame {
        FakeFrame { regs: HashMap::new(), mem: HashMap::new(), cfa: Some(0x7fff_0000) }
    }

    #[test]
    fn lit_plus_uconst() {
        let expr = Expression::decode(&[0x30 + 3, 0x23, 4]).unwrap(); // lit3, plus_uconst 4
        let ctx = frame();
        let result = Evaluator::new(&ctx).evaluate(&expr).unwrap();
        assert_eq!(result, 7);
    }

    #[test]
    fn call_frame_cfa_plus_offset_then_deref() {
        let mut ctx = frame();
        ctx.mem.insert(0x7fff_0000 - 8, 0x2a);
        // DW_OP_call_frame_cfa, DW_OP_consts -8, DW_OP_plus, DW_OP_deref
        let expr = Expression::decode(&[0x9c, 0x11, 0x78, 0x22, 0x06]).unwrap();
        let result = Evaluator::new(&ctx).evaluate(&expr).unwrap();
        assert_eq!(result, 0x2a);
    }

    #[test]
    fn fbreg_uses_cfa_directly() {
        let mut ctx = frame();
        ctx.mem.insert(0x7fff_0000 - 16, 0xfeed);
        let expr = Expression::decode(&[0x91, 0x70]).unwrap(); // fbreg -16
        let result = Evaluator::new(&ctx).evaluate(&expr).unwrap();
        assert_eq!(result, 0xfeed);
    }

    #[test]
    fn register_location_result_reads_register() {
        let mut ctx = frame();
        ctx.regs.insert(5, 0x99);
        let expr = Expression::decode(&[0x50 + 5]).unwrap(); // reg5
        let result = Evaluator::new(&ctx).evaluate(&expr).unwrap();
        assert_eq!(result, 0x99);
    }

    #[test]
    fn arithmetic_on_register_location_promotes_first() {
        let mut ctx = frame();
        ctx.regs.insert(0, 10);
        // DW_OP_reg0, ... arithmetic requires breg/const path since reg alone
        // can't be added to; promote via plus_uconst after a breg read instead.
        let expr = Expression::decode(&[0x70, 0x00, 0x23, 5]).unwrap(); // breg0+0, plus_uconst 5
        ctx.regs.insert(0, 100);
        let result = Evaluator::new(&ctx).evaluate_location(&expr).unwrap();
        assert!(result.is_memory_loc());
        assert_eq!(result.payload(), 105);
    }

    #[test]
    fn plus_mixed_signedness_yields_signed() {
        let ctx = frame();
        // DW_OP_const1s -1, DW_OP_const1u 1, DW_OP_plus
        let expr = Expression::decode(&[0x09, 0xff, 0x08, 0x01, 0x22]).unwrap();
        let result = Evaluator::new(&ctx).evaluate_location(&expr).unwrap();
        assert_eq!(result.payload(), 0);
        assert!(result.flags().contains(TypeFlags::SIGNED));
    }

    #[test]
    fn plus_unsigned_unsigned_stays_unsigned() {
        let ctx = frame();
        // DW_OP_const1u 255, DW_OP_const1u 1, DW_OP_plus
        let expr = Expression::decode(&[0x08, 0xff, 0x08, 0x01, 0x22]).unwrap();
        let result = Evaluator::new(&ctx).evaluate_location(&expr).unwrap();
        assert_eq!(result.payload(), 256);
        assert!(result.flags().contains(TypeFlags::UNSIGNED));
        assert!(!result.flags().contains(TypeFlags::SIGNED));
    }

    #[test]
    fn unsigned_div_differs_from_signed_div_on_high_bit() {
        // const8u 0x8000_0000_0000_0000 (high bit set, negative if read as i64),
        // const1u 2, div. Unsigned division gives a huge quotient with the
        // high bit cleared; signed division of the same bit pattern by 2
        // would give a small negative number instead.
        let ctx = frame();
        let mut bytes = vec![0x0e]; // DW_OP_const8u
        bytes.extend_from_slice(&0x8000_0000_0000_0000u64.to_le_bytes());
        bytes.push(0x08); // DW_OP_const1u
        bytes.push(2);
        bytes.push(0x1b); // DW_OP_div
        let expr = Expression::decode(&bytes).unwrap();
        let result = Evaluator::new(&ctx).evaluate_location(&expr).unwrap();
        assert_eq!(result.payload(), 0x4000_0000_0000_0000);
        assert!(result.flags().contains(TypeFlags::UNSIGNED));
    }

    #[test]
    fn division_by_zero_fails() {
        let ctx = frame();
        let expr = Expression::decode(&[0x30, 0x30, 0x1b]).unwrap(); // lit0, lit0, div
        assert!(matches!(Evaluator::new(&ctx).evaluate(&expr), Err(EvalError::DivideByZero)));
    }

    #[test]
    fn stack_underflow_reported_with_counts() {
        let ctx = frame();
        let expr = Expression::decode(&[0x22]).unwrap(); // plus with empty stack
        match Evaluator::new(&ctx).evaluate(&expr) {
            Err(EvalError::Underflow { needed: 2, had: 0 }) => {}
            other => panic!("expected underflow, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_opcode_is_distinct_error() {
        let ctx = frame();
        let expr = Expression::decode(&[0x27]).unwrap(); // xor
        assert!(matches!(Evaluator::new(&ctx).evaluate(&expr), Err(EvalError::Unsupported(_))));
    }

    #[test]
    fn abs_overflows_on_minimum_signed_value() {
        let ctx = frame();
        // DW_OP_const8s i64::MIN, DW_OP_abs
        let mut bytes = vec![0x0f];
        bytes.extend_from_slice(&i64::MIN.to_le_bytes());
        bytes.push(0x19);
        let expr = Expression::decode(&bytes).unwrap();
        assert!(matches!(Evaluator::new(&ctx).evaluate(&expr), Err(EvalError::AbsOverflow)));
    }

    #[test]
    fn entry_value_without_parent_activation_fails_cross_frame() {
        let ctx = frame();
        let expr = Expression::decode(&[0xf3, 1, 0x50 + 5]).unwrap(); // GNU_entry_value(reg5)
        assert!(matches!(
            Evaluator::new(&ctx).evaluate(&expr),
            Err(EvalError::CrossFrame(crate::error::CrossFrameError::NoParentActivation))
        ));
    }
}
