//! Call-site parameter index (C5).
//!
//! At a `DW_TAG_call_site` DIE a compiler records, for each argument it can
//! still reconstruct, the location expression that held that argument's
//! value *at the call*. When the callee later asks "what was my caller's
//! register `rdi` worth when it called me" (`DW_OP_entry_value`), this index
//! is where that question gets answered: look up the call site by the
//! callee's address (or, failing that, by name), then find the recorded
//! parameter whose location expression is structurally identical to the
//! `entry_value` sub-expression.
//!
//! Redesigned from the source system's `pst_call_site_storage`: its two
//! hand-rolled hash-multimaps (by target address, by origin name) become
//! plain `HashMap`s here; the call sites themselves become index-based
//! entries in a `Vec` rather than an intrusive linked list.

use std::collections::HashMap;

use super::expr::Expression;

/// One `DW_TAG_call_site_parameter`: the location a caller's argument lived
/// in at the moment of the call, plus its value if the compiler also emitted
/// `DW_AT_call_value`.
#[derive(Clone, Debug)]
pub struct CallSiteParam {
    pub location: Expression,
    pub value: Option<u64>,
}

/// One `DW_TAG_call_site`: everything a caller's DWARF recorded about a
/// single call instruction.
#[derive(Clone, Debug, Default)]
pub struct CallSite {
    /// Callee's entry address (`DW_AT_call_origin`'s low PC), when known.
    pub target: Option<u64>,
    /// Callee's linkage name, used when the target address can't be
    /// resolved statically (virtual calls, PLT stubs).
    pub origin: Option<String>,
    /// Whether DWARF marked this as a tail call (`DW_AT_call_tail_call` /
    /// `DW_AT_call_all_tail_calls`); carried through purely as a marker for
    /// diagnostic logging, not used in lookup.
    pub tail_call: bool,
    pub params: Vec<CallSiteParam>,
}

impl CallSite {
    /// Finds the recorded parameter whose location expression is
    /// structurally equal to `needle`. Full structural equality, not a
    /// first-match short-circuit — see [`Expression`]'s `PartialEq`.
    pub fn find_param(&self, needle: &Expression) -> Option<&CallSiteParam> {
        self.params.iter().find(|p| &p.location == needle)
    }
}

/// Every call site recorded in one caller activation's function, indexed
/// both by callee target address and by callee name so a lookup can fall
/// back to the name when the address isn't statically known.
#[derive(Debug, Default)]
pub struct CallSiteIndex {
    sites: Vec<CallSite>,
    by_target: HashMap<u64, usize>,
    by_origin: HashMap<String, usize>,
}

impl CallSiteIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, site: CallSite) {
        let idx = self.sites.len();
        if let Some(target) = site.target {
            self.by_target.insert(target, idx);
        }
        if let Some(origin) = &site.origin {
            self.by_origin.insert(origin.clone(), idx);
        }
        self.sites.push(site);
    }

    /// Looks up by callee address first, then by callee name.
    pub fn find(&self, target: Option<u64>, origin: Option<&str>) -> Option<&CallSite> {
        target
            .and_then(|t| self.by_target.get(&t))
            .or_else(|| origin.and_then(|o| self.by_origin.get(o)))
            .map(|&idx| &self.sites[idx])
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dwarf::expr::Expression;

    fn reg_expr(n: u8) -> Expression {
        Expression::decode(&[0x50 + n]).unwrap()
    }

    #[test]
    fn find_by_target_address() {
        let mut idx = CallSiteIndex::new();
        idx.insert(CallSite {
            target: Some(0x4000),
            origin: Some("callee".into()),
            tail_call: false,
            params: vec![CallSiteParam { location: reg_expr(5), value: Some(7) }],
        });
        let site = idx.find(Some(0x4000), None).unwrap();
        assert_eq!(site.origin.as_deref(), Some("callee"));
    }

    #[test]
    fn falls_back_to_origin_name_when_address_unknown() {
        let mut idx = CallSiteIndex::new();
        idx.insert(CallSite {
            target: None,
            origin: Some("indirect_target".into()),
            tail_call: false,
            params: vec![],
        });
        assert!(idx.find(Some(0xdead), Some("indirect_target")).is_some());
        assert!(idx.find(Some(0xdead), Some("other")).is_none());
    }

    #[test]
    fn find_param_requires_full_structural_match() {
        let site = CallSite {
            target: Some(1),
            origin: None,
            tail_call: false,
            params: vec![
                CallSiteParam { location: reg_expr(0), value: Some(1) },
                CallSiteParam { location: reg_expr(5), value: Some(2) },
            ],
        };
        let hit = site.find_param(&reg_expr(5)).unwrap();
        assert_eq!(hit.value, Some(2));
        assert!(site.find_param(&reg_expr(9)).is_none());
    }
}
