//! Call Frame Information: CIE/FDE parsing and row materialization.
//!
//! DWARF §6.4. The CFI is logically a big table:
//!
//! ```text
//! LOC  CFA   R0  R1  ... RN
//! L0   ...
//! L1   ...
//! ```
//!
//! The first column is a code address; the remaining columns are the rule
//! for recovering the Canonical Frame Address and each register's value in
//! the caller. A CIE holds the instructions common to every function using
//! it (the initial row); an FDE holds one function's additional
//! instructions, replayed on top of the CIE's initial row up to the target
//! pc to materialize that pc's row.
//!
//! This is a from-scratch completion of a hand-rolled parser rather than a
//! `gimli`-backed one: CIE/FDE decoding and row materialization is as much
//! "the hard core" of an unwinder as the expression VM is, so it stays
//! in-house like the rest of this crate's DWARF logic.

use std::collections::HashMap;

use super::expr::Expression;
use crate::error::CfiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfaRule {
    RegisterOffset { register: u16, offset: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterRule {
    Undefined,
    SameValue,
    Offset(i64),
    ValOffset(i64),
    Register(u16),
    Expression(Expression),
    ValExpression(Expression),
}

#[derive(Debug, Clone)]
pub struct UnwindRow {
    pub location: u64,
    pub cfa: CfaRule,
    pub registers: HashMap<u16, RegisterRule>,
}

impl UnwindRow {
    fn initial(return_address_register: u16) -> Self {
        UnwindRow {
            location: 0,
            cfa: CfaRule::RegisterOffset { register: 0, offset: 0 },
            registers: {
                let mut m = HashMap::new();
                m.insert(return_address_register, RegisterRule::Undefined);
                m
            },
        }
    }

    pub fn register(&self, regno: u16) -> RegisterRule {
        self.registers.get(&regno).cloned().unwrap_or(RegisterRule::Undefined)
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, offset: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, CfiError> {
        let b = *self.data.get(self.offset).ok_or(CfiError::Truncated(what))?;
        self.offset += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CfiError> {
        let end = self.offset.checked_add(n).ok_or(CfiError::Truncated(what))?;
        let slice = self.data.get(self.offset..end).ok_or(CfiError::Truncated(what))?;
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, CfiError> {
        Ok(u32::from_le_bytes(self.bytes(4, what)?.try_into().unwrap()))
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, CfiError> {
        Ok(i32::from_le_bytes(self.bytes(4, what)?.try_into().unwrap()))
    }

    fn cstr(&mut self) -> Result<&'a str, CfiError> {
        let nul = self.remaining().iter().position(|&b| b == 0).ok_or(CfiError::Truncated("cstring"))?;
        let s = std::str::from_utf8(&self.remaining()[..nul]).map_err(|_| CfiError::Truncated("cstring"))?;
        self.offset += nul + 1;
        Ok(s)
    }

    fn uleb128(&mut self) -> Result<u64, CfiError> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8("uleb128")?;
            if shift < 64 {
                result |= ((byte & 0x7f) as u64) << shift;
            }
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(CfiError::BadLeb128);
            }
        }
    }

    fn sleb128(&mut self) -> Result<i64, CfiError> {
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8("sleb128")?;
            if shift < 64 {
                result |= ((byte & 0x7f) as i64) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && (byte & 0x40) != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
            if shift > 63 {
                return Err(CfiError::BadLeb128);
            }
        }
    }
}

/// `DW_EH_PE_*` pointer encoding byte: application (high nibble) plus format
/// (low nibble). Only the handful of combinations GCC/LLVM actually emit in
/// `.eh_frame` are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PointerEncoding(u8);

impl PointerEncoding {
    const OMIT: u8 = 0xff;

    fn is_omitted(self) -> bool {
        self.0 == Self::OMIT
    }

    /// Reads one encoded pointer, applying `pcrel`/`datarel` relocation. Only
    /// sdata4/udata4/sdata8/udata8/absptr encodings are read directly;
    /// uleb128-encoded pointers (rare in practice) are rejected.
    fn read(self, c: &mut Cursor<'_>, pc_of_field: u64) -> Result<u64, CfiError> {
        let format = self.0 & 0x0f;
        let application = self.0 & 0x70;
        let raw: i64 = match format {
            0x00 => c.u32("encoded pointer")? as i64, // absptr, 4-byte on 32-bit targets; unused at 8-byte here
            0x03 => c.u32("encoded pointer")? as i64,
            0x04 => i64::from_le_bytes(c.bytes(8, "encoded pointer")?.try_into().unwrap()),
            0x0b => c.i32("encoded pointer")? as i64,
            0x0c => i64::from_le_bytes(c.bytes(8, "encoded pointer")?.try_into().unwrap()),
            other => return Err(CfiError::UnknownEncoding(other)),
        };
        Ok(match application {
            0x00 => raw as u64,
            0x10 => (pc_of_field as i64).wrapping_add(raw) as u64,
            other => return Err(CfiError::UnknownEncoding(other)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Cie {
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub return_address_register: u16,
    fde_pointer_encoding: PointerEncoding,
    initial_instructions: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Fde {
    pub pc_begin: u64,
    pub pc_range: u64,
    instructions: Vec<u8>,
}

/// Parses one CIE starting at `bytes` (the payload after the 4-byte length
/// field and the `CIE_id == 0` marker that identifies it as a CIE).
pub fn parse_cie(bytes: &[u8]) -> Result<Cie, CfiError> {
    let mut c = Cursor::new(bytes);
    let version = c.u8("CIE version")?;
    if version != 1 && version != 3 {
        return Err(CfiError::UnsupportedVersion(version));
    }
    let augmentation = c.cstr()?;
    let code_alignment_factor = c.uleb128()?;
    let data_alignment_factor = c.sleb128()?;
    let return_address_register = c.uleb128()? as u16;

    let mut fde_pointer_encoding = PointerEncoding(PointerEncoding::OMIT);
    if augmentation.starts_with('z') {
        let aug_len = c.uleb128()? as usize;
        let aug_data = c.bytes(aug_len, "CIE augmentation data")?;
        let mut ac = Cursor::new(aug_data);
        for code in augmentation.bytes().skip(1) {
            match code {
                b'L' => {
                    ac.u8("LSDA pointer encoding")?;
                }
                b'P' => {
                    let enc = PointerEncoding(ac.u8("personality encoding")?);
                    if !enc.is_omitted() {
                        let _ = enc.read(&mut ac, 0);
                    }
                }
                b'R' => {
                    fde_pointer_encoding = PointerEncoding(ac.u8("FDE pointer encoding")?);
                }
                b'S' | b'B' => {}
                _ => {}
            }
        }
    }

    Ok(Cie {
        code_alignment_factor,
        data_alignment_factor,
        return_address_register,
        fde_pointer_encoding,
        initial_instructions: c.remaining().to_vec(),
    })
}

/// Parses one FDE starting at `bytes` (the payload after length and
/// `CIE_pointer`), given its already-parsed CIE. `field_pc` is the absolute
/// address of the `pc_begin` field, needed to resolve `pcrel` encodings.
pub fn parse_fde(bytes: &[u8], cie: &Cie, field_pc: u64) -> Result<Fde, CfiError> {
    let mut c = Cursor::new(bytes);
    let encoding = if cie.fde_pointer_encoding.is_omitted() {
        PointerEncoding(0x03) // udata4 absolute, matches most non-PIE eh_frame
    } else {
        cie.fde_pointer_encoding
    };
    let pc_begin = encoding.read(&mut c, field_pc)?;
    // pc_range always uses the format bits only (no pcrel application).
    let range_encoding = PointerEncoding(encoding.0 & 0x0f);
    let pc_range = range_encoding.read(&mut c, 0)?;
    Ok(Fde { pc_begin, pc_range, instructions: c.remaining().to_vec() })
}

/// Replays a CIE's initial instructions, then an FDE's instructions up to
/// (and including) the row covering `pc`, and returns that row.
pub fn row_for_pc(cie: &Cie, fde: &Fde, pc: u64) -> Result<UnwindRow, CfiError> {
    let mut row = UnwindRow::initial(cie.return_address_register);
    row.location = fde.pc_begin;
    execute(&mut row, cie, &cie.initial_instructions)?;
    let initial_row = row.clone();
    let mut stack: Vec<UnwindRow> = Vec::new();
    let mut instrs = Cursor::new(&fde.instructions);
    while instrs.offset < fde.instructions.len() {
        let keep_going = step_one(&mut row, &initial_row, cie, &mut instrs, &mut stack)?;
        if row.location > pc {
            break;
        }
        if !keep_going {
            break;
        }
    }
    Ok(row)
}

fn step_one(
    row: &mut UnwindRow,
    initial_row: &UnwindRow,
    cie: &Cie,
    c: &mut Cursor<'_>,
    stack: &mut Vec<UnwindRow>,
) -> Result<bool, CfiError> {
    let b = c.u8("CFA instruction opcode")?;
    let high2 = b & 0b1100_0000;
    let low6 = b & 0b0011_1111;
    match high2 {
        0x40 => row.location += low6 as u64 * cie.code_alignment_factor, // DW_CFA_advance_loc
        0x80 => {
            // DW_CFA_offset
            let factored = c.uleb128()?;
            row.registers.insert(
                low6 as u16,
                RegisterRule::Offset(factored as i64 * cie.data_alignment_factor),
            );
        }
        0xc0 => {
            // DW_CFA_restore
            let rule = initial_row.register(low6 as u16);
            row.registers.insert(low6 as u16, rule);
        }
        _ => match b {
            0x00 => {} // nop
            0x01 => {
                // set_loc: absolute address, fixed 8 bytes on x86-64 eh_frame
                row.location = u64::from_le_bytes(c.bytes(8, "set_loc address")?.try_into().unwrap());
            }
            0x02 => row.location += c.u8("advance_loc1 delta")? as u64 * cie.code_alignment_factor,
            0x03 => {
                let delta = u16::from_le_bytes(c.bytes(2, "advance_loc2 delta")?.try_into().unwrap());
                row.location += delta as u64 * cie.code_alignment_factor;
            }
            0x04 => {
                let delta = c.u32("advance_loc4 delta")?;
                row.location += delta as u64 * cie.code_alignment_factor;
            }
            0x05 => {
                let reg = c.uleb128()? as u16;
                let factored = c.uleb128()?;
                row.registers.insert(reg, RegisterRule::Offset(factored as i64 * cie.data_alignment_factor));
            }
            0x06 => {
                let reg = c.uleb128()? as u16;
                row.registers.insert(reg, initial_row.register(reg));
            }
            0x07 => {
                let reg = c.uleb128()? as u16;
                row.registers.insert(reg, RegisterRule::Undefined);
            }
            0x08 => {
                let reg = c.uleb128()? as u16;
                row.registers.insert(reg, RegisterRule::SameValue);
            }
            0x09 => {
                let target = c.uleb128()? as u16;
                let from = c.uleb128()? as u16;
                row.registers.insert(target, RegisterRule::Register(from));
            }
            0x0a => stack.push(row.clone()), // remember_state
            0x0b => {
                // restore_state
                if let Some(saved) = stack.pop() {
                    let location = row.location;
                    *row = saved;
                    row.location = location;
                }
            }
            0x0c => {
                let register = c.uleb128()? as u16;
                let offset = c.uleb128()? as i64;
                row.cfa = CfaRule::RegisterOffset { register, offset };
            }
            0x0d => {
                let register = c.uleb128()? as u16;
                if let CfaRule::RegisterOffset { offset, .. } = row.cfa {
                    row.cfa = CfaRule::RegisterOffset { register, offset };
                }
            }
            0x0e => {
                let offset = c.uleb128()? as i64;
                if let CfaRule::RegisterOffset { register, .. } = row.cfa {
                    row.cfa = CfaRule::RegisterOffset { register, offset };
                }
            }
            0x0f => {
                let len = c.uleb128()? as usize;
                let bytes = c.bytes(len, "def_cfa_expression")?;
                let _ = Expression::decode(bytes); // validated, CFA expression form not modeled further
            }
            0x10 => {
                let reg = c.uleb128()? as u16;
                let len = c.uleb128()? as usize;
                let bytes = c.bytes(len, "expression")?;
                let expr = Expression::decode(bytes)?;
                row.registers.insert(reg, RegisterRule::Expression(expr));
            }
            0x11 => {
                let reg = c.uleb128()? as u16;
                let factored = c.sleb128()?;
                row.registers.insert(reg, RegisterRule::Offset(factored * cie.data_alignment_factor));
            }
            0x12 => {
                let register = c.uleb128()? as u16;
                let offset = c.sleb128()? * cie.data_alignment_factor;
                row.cfa = CfaRule::RegisterOffset { register, offset };
            }
            0x13 => {
                let offset = c.sleb128()? * cie.data_alignment_factor;
                if let CfaRule::RegisterOffset { register, .. } = row.cfa {
                    row.cfa = CfaRule::RegisterOffset { register, offset };
                }
            }
            0x14 => {
                let reg = c.uleb128()? as u16;
                let factored = c.uleb128()?;
                row.registers.insert(reg, RegisterRule::ValOffset(factored as i64 * cie.data_alignment_factor));
            }
            0x15 => {
                let reg = c.uleb128()? as u16;
                let factored = c.sleb128()?;
                row.registers.insert(reg, RegisterRule::ValOffset(factored * cie.data_alignment_factor));
            }
            0x16 => {
                let reg = c.uleb128()? as u16;
                let len = c.uleb128()? as usize;
                let bytes = c.bytes(len, "val_expression")?;
                let expr = Expression::decode(bytes)?;
                row.registers.insert(reg, RegisterRule::ValExpression(expr));
            }
            other => return Err(CfiError::UnknownInstruction(other)),
        },
    }
    Ok(true)
}

fn execute(row: &mut UnwindRow, cie: &Cie, instructions: &[u8]) -> Result<(), CfiError> {
    let mut c = Cursor::new(instructions);
    let mut scratch_stack = Vec::new();
    let initial = row.clone();
    while c.offset < instructions.len() {
        step_one(row, &initial, cie, &mut c, &mut scratch_stack)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uleb(mut v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if v == 0 {
                break;
            }
        }
        out
    }

    fn build_cie(ra_reg: u64, code_align: u64, data_align: i64) -> Vec<u8> {
        let mut v = vec![1u8]; // version
        v.push(0); // augmentation = "" (no 'z', no pointer-encoding complexity)
        v.extend(uleb(code_align));
        v.extend(sleb(data_align));
        v.extend(uleb(ra_reg));
        v
    }

    fn sleb(mut v: i64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
            if done {
                out.push(byte);
                break;
            } else {
                out.push(byte | 0x80);
            }
        }
        out
    }

    #[test]
    fn parses_simple_cie_header() {
        let bytes = build_cie(16, 1, -8);
        let cie = parse_cie(&bytes).unwrap();
        assert_eq!(cie.return_address_register, 16);
        assert_eq!(cie.code_alignment_factor, 1);
        assert_eq!(cie.data_alignment_factor, -8);
    }

    #[test]
    fn def_cfa_then_offset_materializes_row() {
        let cie_bytes = build_cie(16, 1, -8);
        let cie = parse_cie(&cie_bytes).unwrap();

        // DW_CFA_def_cfa(register=7, offset=16); DW_CFA_offset(reg=6, factored=2)
        let mut instrs = vec![0x0c];
        instrs.extend(uleb(7));
        instrs.extend(uleb(16));
        instrs.push(0x80 | 6);
        instrs.extend(uleb(2));

        let fde = Fde { pc_begin: 0x1000, pc_range: 0x40, instructions: instrs };
        let row = row_for_pc(&cie, &fde, 0x1000).unwrap();
        assert_eq!(row.cfa, CfaRule::RegisterOffset { register: 7, offset: 16 });
        assert_eq!(row.register(6), RegisterRule::Offset(-16));
    }

    #[test]
    fn advance_loc_stops_replay_before_later_rows() {
        let cie_bytes = build_cie(16, 1, -8);
        let cie = parse_cie(&cie_bytes).unwrap();

        let mut instrs = vec![0x0c];
        instrs.extend(uleb(7));
        instrs.extend(uleb(8));
        instrs.push(0x40 | 4); // advance_loc(4)
        instrs.push(0x0e); // def_cfa_offset
        instrs.extend(uleb(32));

        let fde = Fde { pc_begin: 0x2000, pc_range: 0x40, instructions: instrs };
        let row_before = row_for_pc(&cie, &fde, 0x2000).unwrap();
        assert_eq!(row_before.cfa, CfaRule::RegisterOffset { register: 7, offset: 8 });

        let row_after = row_for_pc(&cie, &fde, 0x2010).unwrap();
        assert_eq!(row_after.cfa, CfaRule::RegisterOffset { register: 7, offset: 32 });
    }

    #[test]
    fn remember_and_restore_state_round_trip() {
        let cie_bytes = build_cie(16, 1, -8);
        let cie = parse_cie(&cie_bytes).unwrap();

        let mut instrs = vec![0x0c];
        instrs.extend(uleb(7));
        instrs.extend(uleb(8));
        instrs.push(0x0a); // remember_state
        instrs.push(0x0e); // def_cfa_offset 99 (temporary)
        instrs.extend(uleb(99));
        instrs.push(0x0b); // restore_state

        let fde = Fde { pc_begin: 0x3000, pc_range: 0x10, instructions: instrs };
        let row = row_for_pc(&cie, &fde, 0x3000).unwrap();
        assert_eq!(row.cfa, CfaRule::RegisterOffset { register: 7, offset: 8 });
    }
}
