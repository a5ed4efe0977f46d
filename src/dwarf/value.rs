//! The DWARF expression VM's typed value and its operand stack.
//!
//! A [`TypedValue`] is a 64-bit payload plus an orthogonal bitset of type
//! flags: signedness, constness, size class, and location-kind. The bitset
//! mirrors the source system's `DWARF_TYPE_*` mask exactly; only the name
//! changed.

use core::fmt;

/// Orthogonal type-tag bits carried alongside a [`TypedValue`]'s payload.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeFlags(u32);

impl TypeFlags {
    pub const SIGNED: TypeFlags = TypeFlags(1 << 0);
    pub const UNSIGNED: TypeFlags = TypeFlags(1 << 1);
    pub const CONST: TypeFlags = TypeFlags(1 << 2);
    pub const GENERIC: TypeFlags = TypeFlags(1 << 3);
    pub const CHAR: TypeFlags = TypeFlags(1 << 4);
    pub const FLOAT: TypeFlags = TypeFlags(1 << 5);
    pub const REGISTER_LOC: TypeFlags = TypeFlags(1 << 6);
    pub const MEMORY_LOC: TypeFlags = TypeFlags(1 << 7);
    pub const SHORT: TypeFlags = TypeFlags(1 << 9);
    pub const INT: TypeFlags = TypeFlags(1 << 10);
    pub const LONG: TypeFlags = TypeFlags(1 << 11);

    pub const NONE: TypeFlags = TypeFlags(0);

    pub fn contains(self, other: TypeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: TypeFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// Strips location-kind bits, leaving the size/signedness tags untouched.
    /// Used by `DW_OP_stack_value` to retag a location description as a
    /// direct value.
    pub fn without_location(self) -> TypeFlags {
        TypeFlags(self.0 & !(Self::REGISTER_LOC.0 | Self::MEMORY_LOC.0))
    }

    pub fn is_location(self) -> bool {
        self.intersects(Self::REGISTER_LOC.or(Self::MEMORY_LOC))
    }

    pub const fn or(self, other: TypeFlags) -> TypeFlags {
        TypeFlags(self.0 | other.0)
    }
}

impl core::ops::BitOr for TypeFlags {
    type Output = TypeFlags;
    fn bitor(self, rhs: TypeFlags) -> TypeFlags {
        self.or(rhs)
    }
}

impl core::ops::BitOrAssign for TypeFlags {
    fn bitor_assign(&mut self, rhs: TypeFlags) {
        *self = self.or(rhs);
    }
}

impl fmt::Debug for TypeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: &[(TypeFlags, &str)] = &[
            (Self::SIGNED, "SIGNED"),
            (Self::UNSIGNED, "UNSIGNED"),
            (Self::CONST, "CONST"),
            (Self::GENERIC, "GENERIC"),
            (Self::CHAR, "CHAR"),
            (Self::FLOAT, "FLOAT"),
            (Self::REGISTER_LOC, "REGISTER_LOC"),
            (Self::MEMORY_LOC, "MEMORY_LOC"),
            (Self::SHORT, "SHORT"),
            (Self::INT, "INT"),
            (Self::LONG, "LONG"),
        ];
        let mut first = true;
        write!(f, "[")?;
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

/// One value on the DWARF expression stack: a 64-bit payload and its type
/// tags. Whether the payload is a direct value, a register number, or a
/// memory address is entirely determined by `flags` — see the single
/// dereference rule on [`Stack::result`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TypedValue {
    payload: u64,
    flags: TypeFlags,
}

impl TypedValue {
    pub fn new(payload: u64, flags: TypeFlags) -> Self {
        TypedValue { payload, flags }
    }

    /// Writes `bytes` (truncated/sign- or zero-extended to `size` bytes) into
    /// a 64-bit slot, honoring the signedness carried in `flags`.
    pub fn from_sized(raw: u64, size: u8, flags: TypeFlags) -> Self {
        let payload = if flags.contains(TypeFlags::SIGNED) {
            sign_extend(raw, size)
        } else {
            zero_extend(raw, size)
        };
        TypedValue::new(payload, flags | size_class(size))
    }

    pub fn payload(self) -> u64 {
        self.payload
    }

    pub fn flags(self) -> TypeFlags {
        self.flags
    }

    pub fn retag(self, flags: TypeFlags) -> Self {
        TypedValue::new(self.payload, flags)
    }

    pub fn is_location(self) -> bool {
        self.flags.is_location()
    }

    pub fn is_register_loc(self) -> bool {
        self.flags.contains(TypeFlags::REGISTER_LOC)
    }

    pub fn is_memory_loc(self) -> bool {
        self.flags.contains(TypeFlags::MEMORY_LOC)
    }

    pub fn is_signed(self) -> bool {
        self.flags.contains(TypeFlags::SIGNED)
    }

    /// Strips location-kind tags, per `DW_OP_stack_value`.
    pub fn as_stack_value(self) -> Self {
        self.retag(self.flags.without_location())
    }
}

fn sign_extend(raw: u64, size: u8) -> u64 {
    match size {
        1 => raw as u8 as i8 as i64 as u64,
        2 => raw as u16 as i16 as i64 as u64,
        4 => raw as u32 as i32 as i64 as u64,
        _ => raw,
    }
}

fn zero_extend(raw: u64, size: u8) -> u64 {
    match size {
        1 => raw as u8 as u64,
        2 => raw as u16 as u64,
        4 => raw as u32 as u64,
        _ => raw,
    }
}

fn size_class(size: u8) -> TypeFlags {
    match size {
        1 => TypeFlags::CHAR,
        2 => TypeFlags::SHORT,
        4 => TypeFlags::INT,
        _ => TypeFlags::LONG,
    }
}

/// A memory/register reader the stack needs to implement the single
/// dereference rule. The evaluator supplies this; the stack never touches a
/// process's memory or registers directly.
pub trait ValueContext {
    fn read_register(&self, dwarf_regno: u16) -> Option<u64>;
    /// Reads `len` bytes (1, 2, 4, or 8) from `addr`, zero-extended to 64 bits.
    fn read_memory(&self, addr: u64, len: u8) -> Option<u64>;
}

/// The DWARF expression VM's operand stack (C2). Scratch state owned by a
/// single evaluation; never shared across expressions.
#[derive(Clone, Debug, Default)]
pub struct Stack {
    values: Vec<TypedValue>,
}

impl Stack {
    pub fn new() -> Self {
        Stack { values: Vec::new() }
    }

    pub fn push(&mut self, payload: u64, size: u8, flags: TypeFlags) {
        self.values.push(TypedValue::from_sized(payload, size, flags));
    }

    pub fn push_value(&mut self, value: TypedValue) {
        self.values.push(value);
    }

    pub fn pop(&mut self) -> Option<TypedValue> {
        self.values.pop()
    }

    /// Peeks `index` entries from the top (0 = top of stack) without popping.
    pub fn peek(&self, index: usize) -> Option<TypedValue> {
        let len = self.values.len();
        index.checked_add(1).and_then(|i| len.checked_sub(i)).map(|i| self.values[i])
    }

    pub fn set(&mut self, index: usize, value: TypedValue) -> bool {
        let len = self.values.len();
        match index.checked_add(1).and_then(|i| len.checked_sub(i)) {
            Some(i) => {
                self.values[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Before dispatching an arithmetic opcode, promote a register-location
    /// top to its register's contents (§4.1: "promotion to GENERIC").
    /// Memory-location tags are left alone so pointer arithmetic stays
    /// addressable.
    pub fn promote_register_top(&mut self, ctx: &dyn ValueContext) -> Result<(), crate::error::EvalError> {
        if let Some(top) = self.peek(0) {
            if top.is_register_loc() {
                let regno = top.payload() as u16;
                let value = ctx
                    .read_register(regno)
                    .ok_or(crate::error::EvalError::BadRegisterRead(regno))?;
                let replaced = TypedValue::new(value, TypeFlags::GENERIC);
                self.set(0, replaced);
            }
        }
        Ok(())
    }

    /// Applies the single-dereference rule: a register-location top reads
    /// that register, a memory-location top reads 8 bytes from that address,
    /// anything else is returned as-is.
    pub fn result(&self, ctx: &dyn ValueContext) -> Result<u64, crate::error::EvalError> {
        let top = self.values.last().copied().ok_or(crate::error::EvalError::Underflow {
            needed: 1,
            had: 0,
        })?;
        if top.is_register_loc() {
            let regno = top.payload() as u16;
            ctx.read_register(regno)
                .ok_or(crate::error::EvalError::BadRegisterRead(regno))
        } else if top.is_memory_loc() {
            ctx.read_memory(top.payload(), 8)
                .ok_or(crate::error::EvalError::BadMemoryRead { addr: top.payload(), len: 8 })
        } else {
            Ok(top.payload())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullContext;
    impl ValueContext for NullContext {
        fn read_register(&self, _: u16) -> Option<u64> {
            None
        }
        fn read_memory(&self, _: u64, _: u8) -> Option<u64> {
            None
        }
    }

    struct FakeContext {
        regs: std::collections::HashMap<u16, u64>,
        mem: std::collections::HashMap<u64, u64>,
    }
    impl ValueContext for FakeContext {
        fn read_register(&self, r: u16) -> Option<u64> {
            self.regs.get(&r).copied()
        }
        fn read_memory(&self, addr: u64, _len: u8) -> Option<u64> {
            self.mem.get(&addr).copied()
        }
    }

    #[test]
    fn push_pop_round_trips_structurally() {
        let mut stack = Stack::new();
        stack.push(7, 4, TypeFlags::UNSIGNED);
        let v = stack.pop().unwrap();
        let mut other = Stack::new();
        other.push_value(v);
        assert_eq!(other.pop().unwrap(), v);
    }

    #[test]
    fn direct_value_result_is_payload() {
        let mut stack = Stack::new();
        stack.push(42, 8, TypeFlags::GENERIC);
        assert_eq!(stack.result(&NullContext).unwrap(), 42);
    }

    #[test]
    fn register_location_dereferences_once() {
        let mut regs = std::collections::HashMap::new();
        regs.insert(5, 0x11);
        let ctx = FakeContext { regs, mem: Default::default() };
        let mut stack = Stack::new();
        stack.push(5, 8, TypeFlags::REGISTER_LOC);
        assert_eq!(stack.result(&ctx).unwrap(), 0x11);
    }

    #[test]
    fn memory_location_dereferences_once() {
        let mut mem = std::collections::HashMap::new();
        mem.insert(0x1000, 0xdead);
        let ctx = FakeContext { regs: Default::default(), mem };
        let mut stack = Stack::new();
        stack.push(0x1000, 8, TypeFlags::MEMORY_LOC);
        assert_eq!(stack.result(&ctx).unwrap(), 0xdead);
    }

    #[test]
    fn sign_extension_on_write() {
        let v = TypedValue::from_sized(0xff, 1, TypeFlags::SIGNED);
        assert_eq!(v.payload(), u64::MAX);
    }

    #[test]
    fn zero_extension_on_write() {
        let v = TypedValue::from_sized(0xff, 1, TypeFlags::UNSIGNED);
        assert_eq!(v.payload(), 0xff);
    }

    #[test]
    fn stack_value_strips_location_tags() {
        let v = TypedValue::new(0x1000, TypeFlags::MEMORY_LOC | TypeFlags::GENERIC);
        let stripped = v.as_stack_value();
        assert!(!stripped.is_location());
        assert_eq!(stripped.payload(), 0x1000);
    }

    #[test]
    fn dup_n_drop_n_is_identity_on_result() {
        let ctx = NullContext;
        let mut stack = Stack::new();
        stack.push(99, 8, TypeFlags::GENERIC);
        let before = stack.result(&ctx).unwrap();
        for _ in 0..3 {
            let top = stack.peek(0).unwrap();
            stack.push_value(top);
        }
        for _ in 0..3 {
            stack.pop();
        }
        assert_eq!(stack.result(&ctx).unwrap(), before);
    }

    proptest::proptest! {
        /// Pushing a value `k` times (dup·k) then popping `k` times (drop·k)
        /// is the identity on the underlying result, for any payload and any
        /// repeat count.
        #[test]
        fn dup_k_drop_k_is_identity(value: u64, k in 0usize..16) {
            let ctx = NullContext;
            let mut stack = Stack::new();
            stack.push(value, 8, TypeFlags::GENERIC);
            let before = stack.result(&ctx).unwrap();
            for _ in 0..k {
                let top = stack.peek(0).unwrap();
                stack.push_value(top);
            }
            for _ in 0..k {
                stack.pop();
            }
            proptest::prop_assert_eq!(stack.result(&ctx).unwrap(), before);
        }
    }
}
