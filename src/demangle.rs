//! Demangler (C11): turns a raw linkage name into something a human can read
//! before it's handed to the renderer. Tries Rust's v0/legacy scheme first,
//! then Itanium C++, and otherwise leaves the name untouched — an unmangled
//! C symbol, or a scheme this crate doesn't know, is passed through as-is.

pub fn demangle(mangled: &str) -> String {
    if let Ok(sym) = rustc_demangle::try_demangle(mangled) {
        return sym.to_string();
    }
    if let Ok(sym) = cpp_demangle::Symbol::new(mangled) {
        if let Ok(s) = sym.demangle(&cpp_demangle::DemangleOptions::default()) {
            return s;
        }
    }
    mangled.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_v0_symbol_demangles() {
        let mangled = "_RNvCs15kBYyAo9fc_7mycrate4main";
        let demangled = demangle(mangled);
        assert!(demangled.contains("mycrate") && demangled.contains("main"));
    }

    #[test]
    fn cpp_symbol_demangles() {
        let demangled = demangle("_Z3fooi");
        assert_eq!(demangled, "foo(int)");
    }

    #[test]
    fn plain_c_symbol_passes_through_unchanged() {
        assert_eq!(demangle("f"), "f");
    }

    #[test]
    fn unknown_scheme_passes_through_unchanged() {
        assert_eq!(demangle("not a mangled name"), "not a mangled name");
    }
}
