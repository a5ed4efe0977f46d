//! Frame cursor (C9): advances a register file one frame at a time.
//!
//! CFI-driven by default — applies a [`crate::dwarf::cfi::UnwindRow`]'s
//! register rules to recover the caller's frame. Falls back to
//! frame-pointer chasing (generalized from the teacher's exploratory
//! `walk::fp` module) for modules with no usable CFI at all.

use tracing::instrument;

use crate::arch::{Registers, DW_RBP, DW_RIP, DW_RSP};
use crate::dwarf::cfi::{CfaRule, RegisterRule, UnwindRow};
use crate::dwarf::eval::{EvalContext, Evaluator};
use crate::dwarf::expr::Expression;
use crate::dwarf::value::ValueContext;
use crate::error::DependencyError;
use crate::module::ModuleIndex;

/// Caps the number of frames a single unwind will walk, guarding against a
/// corrupt or cyclic chain per §4.8's "cap on frame count".
const MAX_FRAMES: usize = 512;

/// One step of frame advancement: the new register file, plus the CFA this
/// step computed (needed by the handler to seed the new activation, and to
/// evaluate `Expression`/`ValExpression` register rules against).
pub struct Step {
    pub registers: Registers,
    pub cfa: Option<u64>,
}

/// Drives frame-to-frame advancement. Owns nothing external; the module
/// index and registers are threaded through explicitly so the cursor itself
/// stays a pure state machine over register files.
pub struct Cursor {
    registers: Registers,
    frames_walked: usize,
}

impl Cursor {
    pub fn new(registers: Registers) -> Self {
        Cursor { registers, frames_walked: 0 }
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Advances to the caller's frame. Returns `Ok(None)` when the chain
    /// ends cleanly (no further module covers the new PC, or the return
    /// address is null); `Err` only for the frame-count cap.
    #[instrument(skip(self, modules))]
    pub fn step(&mut self, modules: &mut ModuleIndex) -> Result<Option<Step>, DependencyError> {
        if self.frames_walked >= MAX_FRAMES {
            return Err(DependencyError::NoModule(self.registers.pc().unwrap_or(0)));
        }
        self.frames_walked += 1;

        let pc = match self.registers.pc() {
            Some(pc) if pc != 0 => pc,
            _ => return Ok(None),
        };

        let step = match self.step_via_cfi(pc, modules) {
            Ok(step) => step,
            Err(_) => self.step_via_frame_pointer()?,
        };

        let Some(new_pc) = step.registers.pc() else { return Ok(None) };
        if new_pc == 0 {
            return Ok(None);
        }
        self.registers = step.registers.clone();
        Ok(Some(step))
    }

    fn step_via_cfi(&self, pc: u64, modules: &mut ModuleIndex) -> Result<Step, DependencyError> {
        let module = modules.module_of(pc)?;
        let target = pc.wrapping_sub(module.bias);

        let (cie, fde) = crate::dwarf::cfi_lookup::find_cie_fde(module, target)
            .ok_or(DependencyError::NoCfi(pc))?;
        let row = crate::dwarf::cfi::row_for_pc(&cie, &fde, target)
            .map_err(|_| DependencyError::NoCfi(pc))?;

        let cfa = compute_cfa(&row, &self.registers);
        let eval_ctx = RowEvalContext { registers: &self.registers, cfa };

        let mut new_registers = Registers::new();
        if let Some(cfa) = cfa {
            new_registers.set(DW_RSP, cfa);
        }
        for regno in 0..crate::arch::NUM_REGISTERS as u16 {
            match row.register(regno) {
                RegisterRule::Undefined => {}
                RegisterRule::SameValue => {
                    if let Some(v) = self.registers.get(regno) {
                        new_registers.set(regno, v);
                    }
                }
                RegisterRule::Offset(offset) => {
                    if let Some(cfa) = cfa {
                        let addr = cfa.wrapping_add_signed(offset);
                        if let Some(v) = eval_ctx.read_memory(addr, 8) {
                            new_registers.set(regno, v);
                        }
                    }
                }
                RegisterRule::ValOffset(offset) => {
                    if let Some(cfa) = cfa {
                        new_registers.set(regno, cfa.wrapping_add_signed(offset));
                    }
                }
                RegisterRule::Register(from) => {
                    if let Some(v) = self.registers.get(from) {
                        new_registers.set(regno, v);
                    }
                }
                RegisterRule::Expression(expr) => {
                    if let Ok(addr) = Evaluator::new(&eval_ctx).evaluate(&expr) {
                        if let Some(v) = eval_ctx.read_memory(addr, 8) {
                            new_registers.set(regno, v);
                        }
                    }
                }
                RegisterRule::ValExpression(expr) => {
                    if let Ok(v) = Evaluator::new(&eval_ctx).evaluate(&expr) {
                        new_registers.set(regno, v);
                    }
                }
            }
        }

        let ra_reg = cie.return_address_register;
        if let Some(ra) = new_registers.get(ra_reg) {
            new_registers.set(DW_RIP, ra);
        }

        Ok(Step { registers: new_registers, cfa })
    }

    /// Frame-pointer-only fallback: `*rbp` is the saved `rbp`, `rbp+8` is the
    /// return address. Mirrors the teacher's `walk::fp` loop.
    fn step_via_frame_pointer(&self) -> Result<Step, DependencyError> {
        let rbp = self.registers.get(DW_RBP).ok_or(DependencyError::NoCfi(0))?;
        if rbp == 0 {
            return Ok(Step { registers: Registers::new(), cfa: None });
        }
        let saved_rbp = crate::walk::fp::read_u64(rbp).ok_or(DependencyError::NoCfi(rbp))?;
        let return_addr = crate::walk::fp::read_u64(rbp.wrapping_add(8)).ok_or(DependencyError::NoCfi(rbp))?;

        let mut regs = Registers::new();
        regs.set(DW_RBP, saved_rbp);
        regs.set(DW_RSP, rbp.wrapping_add(16));
        regs.set(DW_RIP, return_addr);
        Ok(Step { registers: regs, cfa: Some(rbp.wrapping_add(16)) })
    }
}

fn compute_cfa(row: &UnwindRow, registers: &Registers) -> Option<u64> {
    match row.cfa {
        CfaRule::RegisterOffset { register, offset } => {
            registers.get(register).map(|base| base.wrapping_add_signed(offset))
        }
    }
}

/// Adapts a register file plus a precomputed CFA into the [`EvalContext`]
/// needed to evaluate `Expression`/`ValExpression` register rules; these
/// reference `call_frame_cfa` and memory but never `entry_value` (that only
/// occurs in parameter locations, not register-recovery rules).
struct RowEvalContext<'a> {
    registers: &'a Registers,
    cfa: Option<u64>,
}

impl<'a> ValueContext for RowEvalContext<'a> {
    fn read_register(&self, dwarf_regno: u16) -> Option<u64> {
        self.registers.get(dwarf_regno)
    }

    fn read_memory(&self, addr: u64, len: u8) -> Option<u64> {
        // SAFETY: see `ActivationContext::read_memory` — same contract.
        unsafe { crate::activation::read_memory_unchecked(addr, len) }
    }
}

impl<'a> EvalContext for RowEvalContext<'a> {
    fn cfa(&self) -> Option<u64> {
        self.cfa
    }

    fn entry_value(&self, _sub_expr: &Expression) -> Result<u64, crate::error::EvalError> {
        Err(crate::error::CrossFrameError::NoParentActivation.into())
    }
}
