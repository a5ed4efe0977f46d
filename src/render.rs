//! Renderer (C12): formats a resolved activation list into the
//! `unwind_simple`/`unwind_pretty` text reports, and writes the finished
//! report to standard error the way a crash handler has to — through a raw
//! `write(2)`, not a buffered `std::io` path that might itself allocate.

use crate::activation::{Activation, ParamFlags, Parameter};

pub fn render_simple(activations: &[Activation]) -> String {
    let mut out = String::new();
    for (i, a) in activations.iter().enumerate() {
        let name = a.name.as_deref().unwrap_or("??");
        let file = a.file.as_deref().unwrap_or("??");
        let line = a.line.unwrap_or(0);
        out.push_str(&format!("{i:<3} {name} {file}:{line}\n"));
    }
    out
}

pub fn render_pretty(activations: &[Activation]) -> String {
    let mut out = String::new();
    for (i, a) in activations.iter().enumerate() {
        render_activation(&mut out, i, a);
    }
    out
}

fn render_activation(out: &mut String, index: usize, a: &Activation) {
    let name = a.name.as_deref().unwrap_or("??");

    let mut args = Vec::new();
    let mut variadic = false;
    for p in &a.parameters {
        if p.is_unspecified() {
            variadic = true;
            continue;
        }
        if p.flags.contains(ParamFlags::VARIABLE) {
            continue;
        }
        args.push(format!(
            "{} {} = {}",
            p.type_chain.render(),
            p.name.as_deref().unwrap_or("?"),
            render_value(p)
        ));
    }

    let return_type = a.return_type.render();
    out.push_str(&format!("{index:<3} {return_type} {name}("));
    out.push_str(&args.join(", "));
    if variadic {
        if !args.is_empty() {
            out.push_str(", ");
        }
        out.push_str("...");
    }
    out.push(')');
    if let (Some(file), Some(line)) = (&a.file, a.line) {
        out.push_str(&format!(" {file}:{line}"));
    }
    out.push('\n');

    let mut locals: Vec<&Parameter> =
        a.parameters.iter().filter(|p| p.flags.contains(ParamFlags::VARIABLE)).collect();
    if locals.is_empty() {
        return;
    }
    locals.sort_by_key(|p| p.line.unwrap_or(0));

    out.push_str("{\n");
    for local in locals {
        let ty = local.type_chain.render();
        let name = local.name.as_deref().unwrap_or("?");
        out.push_str(&format!(
            "{:04}:   {ty} {name} = {};\n",
            local.line.unwrap_or(0),
            render_value(local)
        ));
    }
    out.push_str("}\n");
}

fn render_value(p: &Parameter) -> String {
    match p.value {
        Some(v) => format!("{v:#x}"),
        None => "<undefined>".to_string(),
    }
}

/// Writes a finished report to standard error via a raw `write(2)`, retrying
/// on a short write — the same approach the teacher's `stdext` writer took,
/// minus the buffering, since this runs inside a signal handler.
pub fn write_report(report: &str) {
    let mut bytes = report.as_bytes();
    while !bytes.is_empty() {
        // SAFETY: `bytes` points at a valid, live slice for the call.
        let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if n <= 0 {
            break;
        }
        bytes = &bytes[n as usize..];
    }
}

pub fn write_no_trace_obtained() {
    write_report("No stack trace obtained\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Registers;
    use crate::dwarf::die::TypeChain;

    fn int_type() -> TypeChain {
        TypeChain { qualifiers: vec![], base_name: Some("int".to_string()), is_void: false }
    }

    fn activation_with_params(params: Vec<Parameter>) -> Activation {
        let mut a = Activation::new(0x1000, 0, Registers::new());
        a.name = Some("f".to_string());
        a.file = Some("main.c".to_string());
        a.line = Some(3);
        a.return_type = int_type();
        a.parameters = params;
        a
    }

    fn param(name: &str, value: Option<u64>, flags: ParamFlags) -> Parameter {
        let has_value = if value.is_some() { ParamFlags::HAS_VALUE } else { ParamFlags::NONE };
        Parameter {
            name: Some(name.to_string()),
            line: Some(3),
            type_chain: int_type(),
            flags: flags | has_value,
            value,
            location: None,
        }
    }

    #[test]
    fn pretty_renders_signature_with_resolved_args() {
        // §8 scenario 1: `void f(int a, int b) { int c = a+b; *(int*)0 = c; }`
        // called as `f(3, 4)`.
        let a = activation_with_params(vec![
            param("a", Some(3), ParamFlags::NONE),
            param("b", Some(4), ParamFlags::NONE),
        ]);
        let report = render_pretty(std::slice::from_ref(&a));
        assert!(report.contains("int f(int a = 0x3, int b = 0x4)"));
    }

    #[test]
    fn pretty_renders_local_body() {
        let c = param("c", Some(7), ParamFlags::VARIABLE);
        let a = activation_with_params(vec![c]);
        let report = render_pretty(std::slice::from_ref(&a));
        assert!(report.contains("0003:   int c = 0x7;"));
        assert!(report.contains("{\n"));
    }

    #[test]
    fn missing_value_renders_undefined() {
        let a = activation_with_params(vec![param("a", None, ParamFlags::NONE)]);
        let report = render_pretty(std::slice::from_ref(&a));
        assert!(report.contains("a = <undefined>"));
    }

    #[test]
    fn variadic_tail_has_no_value_slot() {
        let dotdotdot = param("...", None, ParamFlags::UNSPEC);
        let a = activation_with_params(vec![param("a", Some(1), ParamFlags::NONE), dotdotdot]);
        let report = render_pretty(std::slice::from_ref(&a));
        assert!(report.contains("int a = 0x1, ...)"));
    }

    #[test]
    fn void_return_renders_void_not_unknown() {
        let mut a = activation_with_params(vec![]);
        a.return_type = TypeChain { is_void: true, ..TypeChain::default() };
        let report = render_pretty(std::slice::from_ref(&a));
        assert!(report.contains("void f()"));
    }

    #[test]
    fn simple_report_has_one_line_per_frame() {
        let a = activation_with_params(vec![]);
        let report = render_simple(std::slice::from_ref(&a));
        assert_eq!(report.lines().count(), 1);
        assert!(report.contains("f main.c:3"));
    }
}
