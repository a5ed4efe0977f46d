//! DWARF expression decoding: turns a raw `DW_AT_location`/`DW_CFA_expression`
//! byte string into an ordered [`Expression`] of decoded [`Op`]s.
//!
//! This is the operation table's decode half (C1): one match arm per opcode,
//! reading exactly the operand shape that opcode defines. The table is data
//! (an enum + a match), not function pointers, per the REDESIGN FLAGS.

use crate::error::DecodeError;

macro_rules! dw_op {
    ($($name:ident = $val:expr;)*) => {
        $(pub const $name: u8 = $val;)*
    };
}

#[allow(non_upper_case_globals)]
mod opcodes {
    dw_op! {
        DW_OP_addr = 0x03;
        DW_OP_deref = 0x06;
        DW_OP_const1u = 0x08;
        DW_OP_const1s = 0x09;
        DW_OP_const2u = 0x0a;
        DW_OP_const2s = 0x0b;
        DW_OP_const4u = 0x0c;
        DW_OP_const4s = 0x0d;
        DW_OP_const8u = 0x0e;
        DW_OP_const8s = 0x0f;
        DW_OP_constu = 0x10;
        DW_OP_consts = 0x11;
        DW_OP_dup = 0x12;
        DW_OP_drop = 0x13;
        DW_OP_over = 0x14;
        DW_OP_pick = 0x15;
        DW_OP_swap = 0x16;
        DW_OP_rot = 0x17;
        DW_OP_xderef = 0x18;
        DW_OP_abs = 0x19;
        DW_OP_and = 0x1a;
        DW_OP_div = 0x1b;
        DW_OP_minus = 0x1c;
        DW_OP_mod = 0x1d;
        DW_OP_mul = 0x1e;
        DW_OP_neg = 0x1f;
        DW_OP_not = 0x20;
        DW_OP_or = 0x21;
        DW_OP_plus = 0x22;
        DW_OP_plus_uconst = 0x23;
        DW_OP_shl = 0x24;
        DW_OP_shr = 0x25;
        DW_OP_shra = 0x26;
        DW_OP_xor = 0x27;
        DW_OP_bra = 0x28;
        DW_OP_eq = 0x29;
        DW_OP_ge = 0x2a;
        DW_OP_gt = 0x2b;
        DW_OP_le = 0x2c;
        DW_OP_lt = 0x2d;
        DW_OP_ne = 0x2e;
        DW_OP_skip = 0x2f;
        DW_OP_lit0 = 0x30;
        DW_OP_lit31 = 0x4f;
        DW_OP_reg0 = 0x50;
        DW_OP_reg31 = 0x6f;
        DW_OP_breg0 = 0x70;
        DW_OP_breg31 = 0x8f;
        DW_OP_regx = 0x90;
        DW_OP_fbreg = 0x91;
        DW_OP_bregx = 0x92;
        DW_OP_piece = 0x93;
        DW_OP_deref_size = 0x94;
        DW_OP_xderef_size = 0x95;
        DW_OP_nop = 0x96;
        DW_OP_push_object_address = 0x97;
        DW_OP_call2 = 0x98;
        DW_OP_call4 = 0x99;
        DW_OP_call_ref = 0x9a;
        DW_OP_form_tls_address = 0x9b;
        DW_OP_call_frame_cfa = 0x9c;
        DW_OP_bit_piece = 0x9d;
        DW_OP_implicit_value = 0x9e;
        DW_OP_stack_value = 0x9f;
        DW_OP_GNU_entry_value = 0xf3;
        DW_OP_entry_value = 0xa3;
    }
}
use opcodes::*;

/// One decoded DWARF expression opcode and its operands. `arg1`/`arg2` hold
/// whatever the opcode's operand shape calls for (an immediate, a register
/// number, an offset reinterpreted as `u64`, ...); `sub_expr` is non-empty
/// only for `entry_value`/`GNU_entry_value`, which carries a nested
/// expression rather than a scalar operand.
///
/// Equality is `#[derive]`d and therefore fully structural with no
/// short-circuit: this is the fix for REDESIGN FLAG (b).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Op {
    pub code: u8,
    pub arg1: u64,
    pub arg2: u64,
    pub sub_expr: Vec<u8>,
}

impl Op {
    fn simple(code: u8) -> Self {
        Op { code, arg1: 0, arg2: 0, sub_expr: Vec::new() }
    }

    fn one(code: u8, arg1: u64) -> Self {
        Op { code, arg1, arg2: 0, sub_expr: Vec::new() }
    }

    fn two(code: u8, arg1: u64, arg2: u64) -> Self {
        Op { code, arg1, arg2, sub_expr: Vec::new() }
    }

    pub fn name(&self) -> &'static str {
        opcode_name(self.code)
    }
}

/// An ordered, owned sequence of decoded operations. Structural equality over
/// opcode and operands is the matching key the call-site resolver uses to
/// pair an `entry_value` sub-expression with a recorded call-site parameter
/// location (§4.4).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Expression(pub Vec<Op>);

impl Expression {
    pub fn decode(bytes: &[u8]) -> Result<Expression, DecodeError> {
        let mut cursor = Cursor(bytes);
        let mut ops = Vec::new();
        while !cursor.0.is_empty() {
            ops.push(decode_one(&mut cursor)?);
        }
        Ok(Expression(ops))
    }

    pub fn ops(&self) -> &[Op] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn byte(&mut self, op: u8) -> Result<u8, DecodeError> {
        let (first, rest) = self.0.split_first().ok_or(DecodeError::Truncated(op))?;
        self.0 = rest;
        Ok(*first)
    }

    fn bytes(&mut self, op: u8, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.0.len() < n {
            return Err(DecodeError::Truncated(op));
        }
        let (taken, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(taken)
    }

    fn fixed_u(&mut self, op: u8, n: usize) -> Result<u64, DecodeError> {
        let bytes = self.bytes(op, n)?;
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn fixed_s(&mut self, op: u8, n: usize) -> Result<u64, DecodeError> {
        let raw = self.fixed_u(op, n)?;
        let shift = (8 - n) * 8;
        Ok(((raw << shift) as i64 >> shift) as u64)
    }

    fn uleb128(&mut self, op: u8) -> Result<u64, DecodeError> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.byte(op)?;
            if shift < 64 {
                result |= ((byte & 0x7f) as u64) << shift;
            }
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::BadLeb128);
            }
        }
    }

    fn sleb128(&mut self, op: u8) -> Result<i64, DecodeError> {
        let mut result: i64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.byte(op)?;
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
                return Err(DecodeError::BadLeb128);
            }
        }
    }
}

fn decode_one(c: &mut Cursor<'_>) -> Result<Op, DecodeError> {
    let code = c.byte(0)?;
    Ok(match code {
        DW_OP_addr => Op::one(code, c.fixed_u(code, 8)?),
        DW_OP_deref | DW_OP_xderef | DW_OP_dup | DW_OP_drop | DW_OP_over | DW_OP_swap
        | DW_OP_rot | DW_OP_abs | DW_OP_and | DW_OP_div | DW_OP_minus | DW_OP_mod | DW_OP_mul
        | DW_OP_neg | DW_OP_not | DW_OP_or | DW_OP_plus | DW_OP_shl | DW_OP_shr | DW_OP_shra
        | DW_OP_xor | DW_OP_eq | DW_OP_ge | DW_OP_gt | DW_OP_le | DW_OP_lt | DW_OP_ne
        | DW_OP_nop | DW_OP_push_object_address | DW_OP_form_tls_address
        | DW_OP_call_frame_cfa | DW_OP_stack_value => Op::simple(code),
        DW_OP_const1u => Op::one(code, c.fixed_u(code, 1)?),
        DW_OP_const1s => Op::one(code, c.fixed_s(code, 1)?),
        DW_OP_const2u => Op::one(code, c.fixed_u(code, 2)?),
        DW_OP_const2s => Op::one(code, c.fixed_s(code, 2)?),
        DW_OP_const4u => Op::one(code, c.fixed_u(code, 4)?),
        DW_OP_const4s => Op::one(code, c.fixed_s(code, 4)?),
        DW_OP_const8u => Op::one(code, c.fixed_u(code, 8)?),
        DW_OP_const8s => Op::one(code, c.fixed_s(code, 8)?),
        DW_OP_constu => Op::one(code, c.uleb128(code)?),
        DW_OP_consts => Op::one(code, c.sleb128(code)? as u64),
        DW_OP_pick | DW_OP_deref_size | DW_OP_xderef_size => Op::one(code, c.byte(code)? as u64),
        DW_OP_plus_uconst => Op::one(code, c.uleb128(code)?),
        DW_OP_bra | DW_OP_skip => Op::one(code, c.fixed_s(code, 2)?),
        DW_OP_lit0..=DW_OP_lit31 => Op::one(code, (code - DW_OP_lit0) as u64),
        DW_OP_reg0..=DW_OP_reg31 => Op::one(code, (code - DW_OP_reg0) as u64),
        DW_OP_breg0..=DW_OP_breg31 => {
            let offset = c.sleb128(code)?;
            Op::two(code, (code - DW_OP_breg0) as u64, offset as u64)
        }
        DW_OP_regx => Op::one(code, c.uleb128(code)?),
        DW_OP_fbreg => Op::one(code, c.sleb128(code)? as u64),
        DW_OP_bregx => {
            let reg = c.uleb128(code)?;
            let offset = c.sleb128(code)?;
            Op::two(code, reg, offset as u64)
        }
        DW_OP_piece => Op::one(code, c.uleb128(code)?),
        DW_OP_bit_piece => {
            let size = c.uleb128(code)?;
            let offset = c.uleb128(code)?;
            Op::two(code, size, offset)
        }
        DW_OP_call2 => Op::one(code, c.fixed_u(code, 2)?),
        DW_OP_call4 => Op::one(code, c.fixed_u(code, 4)?),
        DW_OP_call_ref => Op::one(code, c.fixed_u(code, 4)?),
        DW_OP_implicit_value => {
            let len = c.uleb128(code)? as usize;
            let data = c.bytes(code, len)?;
            Op { code, arg1: len as u64, arg2: 0, sub_expr: data.to_vec() }
        }
        DW_OP_entry_value | DW_OP_GNU_entry_value => {
            let len = c.uleb128(code)? as usize;
            let data = c.bytes(code, len)?;
            Op { code, arg1: len as u64, arg2: 0, sub_expr: data.to_vec() }
        }
        other => return Err(DecodeError::UnknownOpcode(other)),
    })
}

pub fn opcode_name(code: u8) -> &'static str {
    match code {
        DW_OP_addr => "DW_OP_addr",
        DW_OP_deref => "DW_OP_deref",
        DW_OP_const1u => "DW_OP_const1u",
        DW_OP_const1s => "DW_OP_const1s",
        DW_OP_const2u => "DW_OP_const2u",
        DW_OP_const2s => "DW_OP_const2s",
        DW_OP_const4u => "DW_OP_const4u",
        DW_OP_const4s => "DW_OP_const4s",
        DW_OP_const8u => "DW_OP_const8u",
        DW_OP_const8s => "DW_OP_const8s",
        DW_OP_constu => "DW_OP_constu",
        DW_OP_consts => "DW_OP_consts",
        DW_OP_dup => "DW_OP_dup",
        DW_OP_drop => "DW_OP_drop",
        DW_OP_over => "DW_OP_over",
        DW_OP_pick => "DW_OP_pick",
        DW_OP_swap => "DW_OP_swap",
        DW_OP_rot => "DW_OP_rot",
        DW_OP_xderef => "DW_OP_xderef",
        DW_OP_abs => "DW_OP_abs",
        DW_OP_and => "DW_OP_and",
        DW_OP_div => "DW_OP_div",
        DW_OP_minus => "DW_OP_minus",
        DW_OP_mod => "DW_OP_mod",
        DW_OP_mul => "DW_OP_mul",
        DW_OP_neg => "DW_OP_neg",
        DW_OP_not => "DW_OP_not",
        DW_OP_or => "DW_OP_or",
        DW_OP_plus => "DW_OP_plus",
        DW_OP_plus_uconst => "DW_OP_plus_uconst",
        DW_OP_shl => "DW_OP_shl",
        DW_OP_shr => "DW_OP_shr",
        DW_OP_shra => "DW_OP_shra",
        DW_OP_xor => "DW_OP_xor",
        DW_OP_bra => "DW_OP_bra",
        DW_OP_eq => "DW_OP_eq",
        DW_OP_ge => "DW_OP_ge",
        DW_OP_gt => "DW_OP_gt",
        DW_OP_le => "DW_OP_le",
        DW_OP_lt => "DW_OP_lt",
        DW_OP_ne => "DW_OP_ne",
        DW_OP_skip => "DW_OP_skip",
        DW_OP_lit0..=DW_OP_lit31 => "DW_OP_litN",
        DW_OP_reg0..=DW_OP_reg31 => "DW_OP_regN",
        DW_OP_breg0..=DW_OP_breg31 => "DW_OP_bregN",
        DW_OP_regx => "DW_OP_regx",
        DW_OP_fbreg => "DW_OP_fbreg",
        DW_OP_bregx => "DW_OP_bregx",
        DW_OP_piece => "DW_OP_piece",
        DW_OP_deref_size => "DW_OP_deref_size",
        DW_OP_xderef_size => "DW_OP_xderef_size",
        DW_OP_nop => "DW_OP_nop",
        DW_OP_push_object_address => "DW_OP_push_object_address",
        DW_OP_call2 => "DW_OP_call2",
        DW_OP_call4 => "DW_OP_call4",
        DW_OP_call_ref => "DW_OP_call_ref",
        DW_OP_form_tls_address => "DW_OP_form_tls_address",
        DW_OP_call_frame_cfa => "DW_OP_call_frame_cfa",
        DW_OP_bit_piece => "DW_OP_bit_piece",
        DW_OP_implicit_value => "DW_OP_implicit_value",
        DW_OP_stack_value => "DW_OP_stack_value",
        DW_OP_entry_value => "DW_OP_entry_value",
        DW_OP_GNU_entry_value => "DW_OP_GNU_entry_value",
        _ => "DW_OP_unknown",
    }
}

pub use opcodes::{
    DW_OP_GNU_entry_value, DW_OP_abs, DW_OP_addr, DW_OP_and, DW_OP_bit_piece, DW_OP_bra,
    DW_OP_breg0, DW_OP_breg31, DW_OP_bregx, DW_OP_call_frame_cfa, DW_OP_call_ref,
    DW_OP_const1s, DW_OP_const1u, DW_OP_const2s, DW_OP_const2u, DW_OP_const4s, DW_OP_const4u,
    DW_OP_const8s, DW_OP_const8u, DW_OP_consts, DW_OP_constu, DW_OP_deref, DW_OP_deref_size,
    DW_OP_div, DW_OP_drop, DW_OP_dup, DW_OP_entry_value, DW_OP_eq, DW_OP_fbreg,
    DW_OP_form_tls_address, DW_OP_ge, DW_OP_gt, DW_OP_implicit_value, DW_OP_le, DW_OP_lit0,
    DW_OP_lit31, DW_OP_lt, DW_OP_minus, DW_OP_mod, DW_OP_mul, DW_OP_ne, DW_OP_neg, DW_OP_nop,
    DW_OP_not, DW_OP_or, DW_OP_over, DW_OP_pick, DW_OP_piece, DW_OP_plus, DW_OP_plus_uconst,
    DW_OP_push_object_address, DW_OP_reg0, DW_OP_reg31, DW_OP_regx, DW_OP_rot, DW_OP_shl,
    DW_OP_shr, DW_OP_shra, DW_OP_skip, DW_OP_stack_value, DW_OP_swap, DW_OP_xderef,
    DW_OP_xderef_size, DW_OP_xor,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_lit_and_stack_value() {
        // DW_OP_lit7, DW_OP_stack_value
        let expr = Expression::decode(&[0x30 + 7, DW_OP_stack_value]).unwrap();
        assert_eq!(expr.ops().len(), 2);
        assert_eq!(expr.ops()[0].arg1, 7);
    }

    #[test]
    fn decodes_fbreg_sleb() {
        // DW_OP_fbreg, sleb128(-8) = 0x78
        let expr = Expression::decode(&[DW_OP_fbreg, 0x78]).unwrap();
        assert_eq!(expr.ops()[0].arg1 as i64, -8);
    }

    #[test]
    fn decodes_bregx_two_lebs() {
        // DW_OP_bregx, reg=5, offset=-16 (sleb128: 0x70)
        let expr = Expression::decode(&[DW_OP_bregx, 5, 0x70]).unwrap();
        assert_eq!(expr.ops()[0].arg1, 5);
        assert_eq!(expr.ops()[0].arg2 as i64, -16);
    }

    #[test]
    fn structural_equality_is_full_not_short_circuit() {
        let a = Expression::decode(&[DW_OP_reg0 + 5, DW_OP_stack_value]).unwrap();
        let b = Expression::decode(&[DW_OP_reg0 + 5, DW_OP_call_frame_cfa]).unwrap();
        // first op matches (both reg5), second differs: must NOT be equal.
        assert_ne!(a, b);
    }

    #[test]
    fn equal_opcode_sequences_match() {
        let a = Expression::decode(&[DW_OP_fbreg, 0x7c]).unwrap();
        let b = Expression::decode(&[DW_OP_fbreg, 0x7c]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_opcode_fails_decode() {
        assert!(Expression::decode(&[0xff]).is_err());
    }

    #[test]
    fn entry_value_carries_sub_expression_bytes() {
        // DW_OP_GNU_entry_value, len=1, sub-expr: DW_OP_reg5
        let expr = Expression::decode(&[DW_OP_GNU_entry_value, 1, DW_OP_reg0 + 5]).unwrap();
        assert_eq!(expr.ops()[0].sub_expr, vec![DW_OP_reg0 + 5]);
    }

    fn encode_uleb128(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    fn encode_sleb128(mut value: i64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if !done {
                byte |= 0x80;
            }
            out.push(byte);
            if done {
                break;
            }
        }
    }

    proptest::proptest! {
        /// `DW_OP_constu`'s ULEB128 operand round-trips for any u64: encoding
        /// then decoding must reproduce the original value exactly.
        #[test]
        fn uleb128_round_trips(value: u64) {
            let mut bytes = vec![DW_OP_constu];
            encode_uleb128(value, &mut bytes);
            let expr = Expression::decode(&bytes).unwrap();
            proptest::prop_assert_eq!(expr.ops()[0].arg1, value);
        }

        /// `DW_OP_consts`'s SLEB128 operand round-trips for any i64.
        #[test]
        fn sleb128_round_trips(value: i64) {
            let mut bytes = vec![DW_OP_consts];
            encode_sleb128(value, &mut bytes);
            let expr = Expression::decode(&bytes).unwrap();
            proptest::prop_assert_eq!(expr.ops()[0].arg1 as i64, value);
        }
    }
}
