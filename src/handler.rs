//! Handler/orchestrator (C7): walks the frame cursor into an arena of
//! [`Activation`]s, links each to its caller, then runs the frame/parameter
//! resolvers (C4/C6) innermost-caller-first so a callee's `entry_value`
//! always finds its caller's call-site index already populated.

use crate::activation::{Activation, ParamFlags, Parameter};
use crate::arch::Registers;
use crate::cursor::Cursor;
use crate::demangle::demangle;
use crate::dwarf::callsite::{CallSite, CallSiteIndex, CallSiteParam};
use crate::dwarf::die::{CallTarget, LocationAttr, RawCallSite, RawParam};
use crate::dwarf::eval::{EvalContext, Evaluator};
use crate::dwarf::expr::Expression;
use crate::dwarf::value::ValueContext;
use crate::error::{CrossFrameError, EvalError, UnwindError};
use crate::module::ModuleIndex;
use crate::render;

/// Owns the module index and the activation arena for one unwind. Built
/// either from a captured `ucontext_t` (the signal shim's entry point) or
/// directly from a [`Registers`] snapshot (tests, and embedders that capture
/// context some other way).
pub struct Handler {
    activations: Vec<Activation>,
}

impl Handler {
    /// Builds a handler from a captured `ucontext_t`, as the signal shim does.
    ///
    /// # Safety
    /// `ctx` must point to a valid, fully-initialized `ucontext_t` as handed
    /// to an `SA_SIGINFO` handler.
    #[cfg(target_os = "linux")]
    pub unsafe fn new(ctx: *const libc::ucontext_t) -> Handler {
        let gregs = (*ctx).uc_mcontext.gregs.as_ptr();
        let registers = Registers::from_gregs(gregs);
        Handler::from_registers(registers)
    }

    /// Builds a handler directly from a register file.
    pub fn from_registers(registers: Registers) -> Handler {
        let mut modules = ModuleIndex::new();
        let activations = walk(registers, &mut modules);
        let mut handler = Handler { activations };
        handler.resolve_all(&mut modules);
        handler
    }

    /// The resolved activation list, faulting frame first.
    pub fn functions(&self) -> &[Activation] {
        &self.activations
    }

    /// Renders `frame_index  function  file:line` only.
    pub fn unwind_simple(&self) -> Result<(), UnwindError> {
        if self.activations.is_empty() {
            return Err(UnwindError::NoTraceObtained);
        }
        render::write_report(&render::render_simple(&self.activations));
        Ok(())
    }

    /// Renders the full parameter/local reconstruction.
    pub fn unwind_pretty(&self) -> Result<(), UnwindError> {
        if self.activations.is_empty() {
            return Err(UnwindError::NoTraceObtained);
        }
        render::write_report(&render::render_pretty(&self.activations));
        Ok(())
    }

    fn resolve_all(&mut self, modules: &mut ModuleIndex) {
        let len = self.activations.len();
        for idx in (0..len).rev() {
            self.resolve_one(idx, modules);
        }
    }

    fn resolve_one(&mut self, idx: usize, modules: &mut ModuleIndex) {
        let pc = self.activations[idx].pc;
        let Ok(module) = modules.module_of(pc) else { return };
        let bias = module.bias;
        let Ok(sub) = module.die_at(pc) else { return };

        let (current, parent) = self.activations.split_at_mut(idx + 1);
        let activation = &mut current[idx];
        activation.low_pc = Some(sub.low_pc);
        activation.high_pc = Some(sub.high_pc);
        if let Some(name) = &sub.name {
            activation.name = Some(demangle(name));
        }
        activation.return_type = sub.return_type.clone();

        let parent_call_sites = parent.first().map(|p| &p.call_sites);
        let ctx = ResolveContext {
            registers: &activation.registers,
            cfa: activation.cfa,
            callee_entry_address: activation.entry_address(),
            callee_name: activation.name.as_deref(),
            parent_call_sites,
        };

        let target_pc = pc.wrapping_sub(bias);
        activation.parameters =
            sub.params.iter().map(|p| resolve_param(p, target_pc, &ctx)).collect();
        for raw_site in &sub.call_sites {
            if raw_site.tail_call {
                tracing::debug!(origin = ?raw_site.origin, "resolving tail-call site");
            }
            activation.call_sites.insert(resolve_call_site(raw_site, bias, &ctx));
        }
    }
}

/// Walks the frame cursor from `registers` building the ordered activation
/// list (faulting frame first), linking each activation's `parent` to the
/// one stepped to immediately after it.
fn walk(registers: Registers, modules: &mut ModuleIndex) -> Vec<Activation> {
    let mut activations = Vec::new();
    let mut cursor = Cursor::new(registers);

    loop {
        let Some(pc) = cursor.registers().pc().filter(|&pc| pc != 0) else { break };
        let sp = cursor.registers().sp().unwrap_or(0);
        let mut activation = Activation::new(pc, sp, cursor.registers().clone());
        bind_symbol(&mut activation, modules);

        let step = cursor.step(modules).unwrap_or(None);
        activation.cfa = step.as_ref().and_then(|s| s.cfa);

        let new_index = activations.len();
        activations.push(activation);
        if new_index > 0 {
            activations[new_index - 1].parent = Some(new_index);
        }

        if step.is_none() {
            break;
        }
    }

    activations
}

fn bind_symbol(activation: &mut Activation, modules: &mut ModuleIndex) {
    let Ok(module) = modules.module_of(activation.pc) else { return };
    activation.module_bias = module.bias;
    if let Ok((file, line)) = module.line_at(activation.pc) {
        activation.file = Some(file);
        activation.line = Some(line);
    }
    if let Some(sym) = module.symbol_at(activation.pc) {
        activation.name = Some(demangle(sym));
    }
}

/// Adapts one activation's registers/CFA plus its (already-resolved) parent
/// call-site index into the [`EvalContext`] the evaluator needs, without
/// holding a borrow over the whole arena — `resolve_one` mutates the current
/// activation while this only reads its own fields and the parent's.
struct ResolveContext<'a> {
    registers: &'a Registers,
    cfa: Option<u64>,
    callee_entry_address: Option<u64>,
    callee_name: Option<&'a str>,
    parent_call_sites: Option<&'a CallSiteIndex>,
}

impl<'a> ValueContext for ResolveContext<'a> {
    fn read_register(&self, dwarf_regno: u16) -> Option<u64> {
        self.registers.get(dwarf_regno)
    }

    fn read_memory(&self, addr: u64, len: u8) -> Option<u64> {
        // SAFETY: see `crate::activation::read_memory_unchecked`.
        unsafe { crate::activation::read_memory_unchecked(addr, len) }
    }
}

impl<'a> EvalContext for ResolveContext<'a> {
    fn cfa(&self) -> Option<u64> {
        self.cfa
    }

    fn entry_value(&self, sub_expr: &Expression) -> Result<u64, EvalError> {
        let sites = self.parent_call_sites.ok_or(CrossFrameError::NoParentActivation)?;
        let site = sites
            .find(self.callee_entry_address, self.callee_name)
            .ok_or(CrossFrameError::CallSiteLookupMiss)?;
        let param = site.find_param(sub_expr).ok_or(CrossFrameError::SubExpressionMismatch)?;
        param.value.ok_or(CrossFrameError::SubExpressionMismatch.into())
    }
}

fn resolve_param(raw: &RawParam, pc: u64, ctx: &ResolveContext<'_>) -> Parameter {
    if raw.is_unspecified {
        return Parameter {
            name: raw.name.clone(),
            line: None,
            type_chain: raw.type_chain.clone(),
            flags: ParamFlags::UNSPEC,
            value: None,
            location: None,
        };
    }

    let mut flags = if raw.is_variable { ParamFlags::VARIABLE } else { ParamFlags::NONE };
    let (value, location) = match &raw.location {
        LocationAttr::Const(n) => {
            flags |= ParamFlags::CONST;
            (Some(*n), None)
        }
        LocationAttr::Unavailable => (None, None),
        other => match other.resolve_at(pc) {
            Some(expr) => match Evaluator::new(ctx).evaluate(expr) {
                Ok(v) => (Some(v), Some(expr.clone())),
                Err(_) => (None, Some(expr.clone())),
            },
            None => (None, None),
        },
    };
    if value.is_some() {
        flags |= ParamFlags::HAS_VALUE;
    }
    Parameter { name: raw.name.clone(), line: raw.line, type_chain: raw.type_chain.clone(), flags, value, location }
}

fn resolve_call_site(raw: &RawCallSite, bias: u64, ctx: &ResolveContext<'_>) -> CallSite {
    let target = match &raw.target {
        CallTarget::Address(low) => Some(bias.wrapping_add(*low)),
        CallTarget::Expr(expr) => Evaluator::new(ctx).evaluate(expr).ok(),
        CallTarget::Unknown => None,
    };
    let params = raw
        .params
        .iter()
        .map(|p| CallSiteParam {
            location: p.location.clone(),
            value: p.value.as_ref().and_then(|expr| Evaluator::new(ctx).evaluate(expr).ok()),
        })
        .collect();
    CallSite { target, origin: raw.origin.clone(), tail_call: raw.tail_call, params }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::DW_RIP;

    #[test]
    fn empty_trace_reports_no_trace_obtained() {
        let handler = Handler { activations: Vec::new() };
        assert!(matches!(handler.unwind_simple(), Err(UnwindError::NoTraceObtained)));
        assert!(matches!(handler.unwind_pretty(), Err(UnwindError::NoTraceObtained)));
    }

    #[test]
    fn walk_stops_at_null_pc() {
        let registers = Registers::new(); // pc() is None, loop should not spin
        let mut modules = ModuleIndex::new();
        let activations = walk(registers, &mut modules);
        assert!(activations.is_empty());
    }

    #[test]
    fn walk_single_unresolvable_frame_terminates() {
        let mut registers = Registers::new();
        registers.set(DW_RIP, 0x1);
        let mut modules = ModuleIndex::new();
        let activations = walk(registers, &mut modules);
        // no module covers an address this low; cursor.step's CFI/frame-pointer
        // paths both fail, so the walk records the one frame and stops.
        assert_eq!(activations.len(), 1);
        assert!(activations[0].parent.is_none());
    }
}
