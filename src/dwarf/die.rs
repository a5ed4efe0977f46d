//! Walks `.debug_info` entries under one `DW_TAG_subprogram` to collect the
//! raw material the parameter resolver (C6) and call-site index (C5) need:
//! formal parameters, locals, and outbound call-site records.
//!
//! Generic over `gimli::Reader` so it works the same whether the bytes come
//! from a live `mmap` (the normal case, via [`crate::module`]) or a `Vec`
//! fixture built by a test.

use gimli::{AttributeValue, DebuggingInformationEntry, Dwarf, Reader, Unit, UnitOffset};

use super::expr::Expression;
use crate::error::DependencyError;

/// One qualifier step on the way from a use site to its terminal base type,
/// reconstructed by walking `DW_AT_type` references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeQualifier {
    Const,
    Pointer,
    Array,
    Typedef(String),
    Struct(String),
    Union(String),
    Class(String),
    Enum(String),
    Subroutine,
}

/// The qualifier chain plus whatever base type terminated it. `base_name` is
/// `None` when the chain dead-ends at `void`, an anonymous composite, or a
/// reference this crate didn't follow (cross-CU `DW_FORM_ref_addr`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeChain {
    pub qualifiers: Vec<TypeQualifier>,
    pub base_name: Option<String>,
    pub is_void: bool,
}

impl TypeChain {
    /// Renders the chain the way a pseudo-source signature wants it:
    /// `const char *`, `foo_t`, `struct point`, ...
    pub fn render(&self) -> String {
        if self.qualifiers.is_empty() && self.base_name.is_none() {
            return if self.is_void { "void".to_string() } else { "<unknown>".to_string() };
        }
        let mut out = String::new();
        for q in self.qualifiers.iter().rev() {
            match q {
                TypeQualifier::Const => out.push_str("const "),
                TypeQualifier::Pointer => out.push('*'),
                TypeQualifier::Array => out.push_str("[]"),
                TypeQualifier::Typedef(name) => out.push_str(name),
                TypeQualifier::Struct(name) => {
                    out.push_str("struct ");
                    out.push_str(name);
                }
                TypeQualifier::Union(name) => {
                    out.push_str("union ");
                    out.push_str(name);
                }
                TypeQualifier::Class(name) => {
                    out.push_str("class ");
                    out.push_str(name);
                }
                TypeQualifier::Enum(name) => {
                    out.push_str("enum ");
                    out.push_str(name);
                }
                TypeQualifier::Subroutine => out.push_str("(*)()"),
            }
        }
        if let Some(base) = &self.base_name {
            if !out.is_empty() && !out.ends_with('*') {
                out.push(' ');
            }
            out.push_str(base);
        }
        out
    }
}

/// Where a `DW_AT_location` attribute points: a single expression, a
/// PC-ranged list of expressions (the old `.debug_loc` loclistptr form), or a
/// compile-time constant.
#[derive(Clone, Debug)]
pub enum LocationAttr {
    Expr(Expression),
    Ranges(Vec<LocRange>),
    Const(u64),
    Unavailable,
}

#[derive(Clone, Debug)]
pub struct LocRange {
    pub start: u64,
    pub end: u64,
    pub expr: Expression,
}

impl LocationAttr {
    /// Selects the expression valid at `pc` per §4.5: the unique range
    /// containing `pc`, first match wins if more than one does.
    pub fn resolve_at(&self, pc: u64) -> Option<&Expression> {
        match self {
            LocationAttr::Expr(e) => Some(e),
            LocationAttr::Ranges(ranges) => {
                ranges.iter().find(|r| pc >= r.start && pc <= r.end).map(|r| &r.expr)
            }
            LocationAttr::Const(_) | LocationAttr::Unavailable => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RawParam {
    pub name: Option<String>,
    pub line: Option<u64>,
    pub type_chain: TypeChain,
    pub location: LocationAttr,
    pub is_variable: bool,
    pub is_unspecified: bool,
}

impl RawParam {
    fn unspecified() -> Self {
        RawParam {
            name: Some("...".to_string()),
            line: None,
            type_chain: TypeChain::default(),
            location: LocationAttr::Unavailable,
            is_variable: false,
            is_unspecified: true,
        }
    }
}

/// A callee target as recorded at a `DW_TAG_call_site`: either resolved
/// statically to an address, or an expression that must be evaluated in the
/// caller's context (an indirect call through a computed address).
#[derive(Clone, Debug)]
pub enum CallTarget {
    Address(u64),
    Expr(Expression),
    Unknown,
}

#[derive(Clone, Debug)]
pub struct RawCallSiteParam {
    pub location: Expression,
    pub value: Option<Expression>,
}

#[derive(Clone, Debug)]
pub struct RawCallSite {
    pub target: CallTarget,
    pub origin: Option<String>,
    pub tail_call: bool,
    pub params: Vec<RawCallSiteParam>,
}

#[derive(Clone, Debug, Default)]
pub struct Subprogram {
    pub low_pc: u64,
    pub high_pc: u64,
    pub name: Option<String>,
    pub return_type: TypeChain,
    pub params: Vec<RawParam>,
    pub call_sites: Vec<RawCallSite>,
}

const MAX_TYPE_DEPTH: usize = 32;

/// Walks the subtree rooted at `offset` (expected to be a `DW_TAG_subprogram`)
/// collecting its formal parameters, locals (including those nested in
/// lexical blocks, flattened per §4.5), unspecified-parameter markers, and
/// outbound call sites. Inlined subroutines are skipped with a debug-level
/// log, matching the "skipped with a diagnostic" requirement.
pub fn walk_subprogram<R: Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    offset: UnitOffset<R::Offset>,
) -> Result<Subprogram, gimli::Error> {
    let mut tree = unit.entries_tree(Some(offset))?;
    let root = tree.root()?;
    let entry = root.entry();
    let (low_pc, high_pc) = pc_range(dwarf, unit, entry)?;
    let name = entry_name(dwarf, unit, entry)?;
    // Absence of DW_AT_type on the subprogram DIE itself means the function
    // returns void; this has to be distinguished from a TypeChain that just
    // failed to resolve (`base_name: None, is_void: false` renders `<unknown>`).
    let return_type = match entry.attr_value(gimli::DW_AT_type)? {
        Some(v) => resolve_type_chain(dwarf, unit, v, 0)?,
        None => TypeChain { is_void: true, ..TypeChain::default() },
    };
    let mut sub = Subprogram { low_pc, high_pc, name, return_type, ..Default::default() };
    walk_children(dwarf, unit, root, &mut sub)?;
    Ok(sub)
}

fn walk_children<R: Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    mut node: gimli::EntriesTreeNode<R>,
    sub: &mut Subprogram,
) -> Result<(), gimli::Error> {
    let mut children = node.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        match entry.tag() {
            gimli::DW_TAG_formal_parameter => {
                sub.params.push(read_param(dwarf, unit, entry, false)?);
            }
            gimli::DW_TAG_variable => {
                sub.params.push(read_param(dwarf, unit, entry, true)?);
            }
            gimli::DW_TAG_unspecified_parameters => {
                sub.params.push(RawParam::unspecified());
            }
            gimli::DW_TAG_lexical_block => {
                walk_children(dwarf, unit, child, sub)?;
            }
            gimli::DW_TAG_inlined_subroutine => {
                tracing::debug!("skipping inlined subroutine during parameter walk");
            }
            gimli::DW_TAG_GNU_call_site | gimli::DW_TAG_call_site => {
                sub.call_sites.push(read_call_site(dwarf, unit, child)?);
            }
            _ => {}
        }
    }
    Ok(())
}

fn read_param<R: Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    entry: &DebuggingInformationEntry<R>,
    is_variable: bool,
) -> Result<RawParam, gimli::Error> {
    let name = entry_name(dwarf, unit, entry)?;
    let line = entry.attr_value(gimli::DW_AT_decl_line)?.and_then(|v| v.udata_value());
    let type_chain = entry
        .attr_value(gimli::DW_AT_type)?
        .map(|v| resolve_type_chain(dwarf, unit, v, 0))
        .transpose()?
        .unwrap_or_default();
    let location = match entry.attr_value(gimli::DW_AT_location)? {
        Some(AttributeValue::Exprloc(expr)) => {
            let bytes = expr.0.to_slice()?;
            Expression::decode(&bytes)
                .map(LocationAttr::Expr)
                .unwrap_or(LocationAttr::Unavailable)
        }
        Some(AttributeValue::LocationListsOffset(off)) => {
            read_loc_ranges(dwarf, unit, off)
        }
        Some(AttributeValue::Udata(n)) => LocationAttr::Const(n),
        Some(AttributeValue::Sdata(n)) => LocationAttr::Const(n as u64),
        Some(AttributeValue::Data1(n)) => LocationAttr::Const(n as u64),
        Some(AttributeValue::Data2(n)) => LocationAttr::Const(n as u64),
        Some(AttributeValue::Data4(n)) => LocationAttr::Const(n as u64),
        Some(AttributeValue::Data8(n)) => LocationAttr::Const(n),
        _ => LocationAttr::Unavailable,
    };
    Ok(RawParam { name, line, type_chain, location, is_variable, is_unspecified: false })
}

fn read_loc_ranges<R: Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    offset: gimli::LocationListsOffset<R::Offset>,
) -> LocationAttr {
    let mut ranges = Vec::new();
    if let Ok(mut iter) = dwarf.locations(unit, offset) {
        while let Ok(Some(entry)) = iter.next() {
            if let Ok(bytes) = entry.data.0.to_slice() {
                if let Ok(expr) = Expression::decode(&bytes) {
                    ranges.push(LocRange { start: entry.range.begin, end: entry.range.end, expr });
                }
            }
        }
    }
    if ranges.is_empty() {
        LocationAttr::Unavailable
    } else {
        LocationAttr::Ranges(ranges)
    }
}

fn read_call_site<R: Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    mut node: gimli::EntriesTreeNode<R>,
) -> Result<RawCallSite, gimli::Error> {
    let entry = node.entry().clone();
    let target = match entry
        .attr_value(gimli::DW_AT_call_origin)?
        .or(entry.attr_value(gimli::DW_AT_abstract_origin)?)
    {
        Some(AttributeValue::DebugInfoRef(off)) => {
            if let Some(target_unit_off) = off.to_unit_offset(&unit.header) {
                let callee = unit.entry(target_unit_off)?;
                match pc_range(dwarf, unit, &callee) {
                    Ok((low, _)) if low != 0 => CallTarget::Address(low),
                    _ => CallTarget::Unknown,
                }
            } else {
                CallTarget::Unknown
            }
        }
        Some(AttributeValue::Exprloc(expr)) => {
            let bytes = expr.0.to_slice()?;
            Expression::decode(&bytes).map(CallTarget::Expr).unwrap_or(CallTarget::Unknown)
        }
        _ => CallTarget::Unknown,
    };
    let origin = entry_name(dwarf, unit, &entry)?;
    let tail_call = entry.attr_value(gimli::DW_AT_call_all_tail_calls)?.is_some()
        || entry.attr_value(gimli::DW_AT_call_tail_call)?.is_some();

    let mut params = Vec::new();
    let mut children = node.children();
    while let Some(child) = children.next()? {
        let p = child.entry();
        if p.tag() == gimli::DW_TAG_GNU_call_site_parameter || p.tag() == gimli::DW_TAG_call_site_parameter
        {
            let location = match p.attr_value(gimli::DW_AT_location)? {
                Some(AttributeValue::Exprloc(expr)) => {
                    let bytes = expr.0.to_slice()?;
                    Expression::decode(&bytes).ok()
                }
                _ => None,
            };
            let value = match p
                .attr_value(gimli::DW_AT_call_value)?
                .or(p.attr_value(gimli::DW_AT_GNU_call_site_value)?)
            {
                Some(AttributeValue::Exprloc(expr)) => {
                    expr.0.to_slice().ok().and_then(|b| Expression::decode(&b).ok())
                }
                _ => None,
            };
            if let Some(location) = location {
                params.push(RawCallSiteParam { location, value });
            }
        }
    }

    Ok(RawCallSite { target, origin, tail_call, params })
}

fn entry_name<R: Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    entry: &DebuggingInformationEntry<R>,
) -> Result<Option<String>, gimli::Error> {
    match entry.attr_value(gimli::DW_AT_name)? {
        Some(value) => {
            let r = dwarf.attr_string(unit, value)?;
            Ok(Some(r.to_string_lossy()?.into_owned()))
        }
        None => match entry.attr_value(gimli::DW_AT_linkage_name)? {
            Some(value) => {
                let r = dwarf.attr_string(unit, value)?;
                Ok(Some(r.to_string_lossy()?.into_owned()))
            }
            None => Ok(None),
        },
    }
}

fn pc_range<R: Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    entry: &DebuggingInformationEntry<R>,
) -> Result<(u64, u64), gimli::Error> {
    let low_pc = match entry.attr_value(gimli::DW_AT_low_pc)? {
        Some(value) => dwarf.attr_address(unit, value)?.unwrap_or(0),
        None => 0,
    };
    let high_pc = match entry.attr_value(gimli::DW_AT_high_pc)? {
        Some(AttributeValue::Udata(offset)) => low_pc + offset,
        Some(value) => dwarf.attr_address(unit, value)?.unwrap_or(low_pc),
        None => low_pc,
    };
    Ok((low_pc, high_pc))
}

/// Walks `DW_AT_type` references, collecting qualifiers until a base type,
/// an anonymous composite, or a cross-CU reference this crate doesn't
/// follow terminates the chain. Bounded by [`MAX_TYPE_DEPTH`] against cyclic
/// or pathologically long chains in malformed input.
fn resolve_type_chain<R: Reader>(
    dwarf: &Dwarf<R>,
    unit: &Unit<R>,
    mut value: AttributeValue<R>,
    depth: usize,
) -> Result<TypeChain, gimli::Error> {
    let mut chain = TypeChain::default();
    let mut depth = depth;
    loop {
        if depth >= MAX_TYPE_DEPTH {
            return Ok(chain);
        }
        depth += 1;
        let offset = match value {
            AttributeValue::UnitRef(off) => off,
            _ => return Ok(chain),
        };
        let entry = match unit.entry(offset) {
            Ok(e) => e,
            Err(_) => return Ok(chain),
        };
        let name = entry_name(dwarf, unit, &entry)?;
        match entry.tag() {
            gimli::DW_TAG_base_type => {
                chain.base_name = name;
                return Ok(chain);
            }
            gimli::DW_TAG_unspecified_type | gimli::DW_TAG_void_type => {
                chain.is_void = true;
                return Ok(chain);
            }
            gimli::DW_TAG_const_type => chain.qualifiers.push(TypeQualifier::Const),
            gimli::DW_TAG_pointer_type => chain.qualifiers.push(TypeQualifier::Pointer),
            gimli::DW_TAG_array_type => chain.qualifiers.push(TypeQualifier::Array),
            gimli::DW_TAG_typedef => {
                chain.qualifiers.push(TypeQualifier::Typedef(name.unwrap_or_default()));
            }
            gimli::DW_TAG_structure_type => {
                chain.qualifiers.push(TypeQualifier::Struct(name.unwrap_or_default()));
                return Ok(chain);
            }
            gimli::DW_TAG_union_type => {
                chain.qualifiers.push(TypeQualifier::Union(name.unwrap_or_default()));
                return Ok(chain);
            }
            gimli::DW_TAG_class_type => {
                chain.qualifiers.push(TypeQualifier::Class(name.unwrap_or_default()));
                return Ok(chain);
            }
            gimli::DW_TAG_enumeration_type => {
                chain.qualifiers.push(TypeQualifier::Enum(name.unwrap_or_default()));
                return Ok(chain);
            }
            gimli::DW_TAG_subroutine_type => {
                chain.qualifiers.push(TypeQualifier::Subroutine);
                return Ok(chain);
            }
            _ => return Ok(chain),
        }
        match entry.attr_value(gimli::DW_AT_type)? {
            Some(next) => value = next,
            None => return Ok(chain),
        }
    }
}

/// A DIE-less `no debug info at all` sentinel the module index returns when
/// `die_at` finds nothing covering a PC, distinct from a malformed DIE tree.
pub fn no_die_error(pc: u64) -> DependencyError {
    DependencyError::NoDie(pc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_chain_renders_pointer_to_const_base() {
        let chain = TypeChain {
            qualifiers: vec![TypeQualifier::Pointer, TypeQualifier::Const],
            base_name: Some("char".to_string()),
            is_void: false,
        };
        assert_eq!(chain.render(), "const *char");
    }

    #[test]
    fn location_attr_resolves_range_containing_pc() {
        let a = Expression::decode(&[0x30]).unwrap();
        let b = Expression::decode(&[0x31]).unwrap();
        let loc = LocationAttr::Ranges(vec![
            LocRange { start: 0, end: 10, expr: a.clone() },
            LocRange { start: 11, end: 20, expr: b.clone() },
        ]);
        assert_eq!(loc.resolve_at(5), Some(&a));
        assert_eq!(loc.resolve_at(15), Some(&b));
        assert_eq!(loc.resolve_at(25), None);
    }
}
