//! Frame-pointer-only fallback: `*rbp` is the caller's saved `rbp`, `rbp+8`
//! is the return address. [`crate::cursor::Cursor`] reaches for this only
//! when a module has no CFI at all — CIE/FDE lookup failed outright, not
//! merely a row miss within a record that exists.

/// Reads one `u64` at `addr` in this process's own address space.
///
/// # Safety
/// See [`crate::activation::read_memory_unchecked`]: unchecked, relying on
/// the signal shim's re-entrancy guard to turn a bad read into clean
/// termination rather than a recursive fault.
pub(crate) fn read_u64(addr: u64) -> Option<u64> {
    if addr == 0 {
        return None;
    }
    // SAFETY: see module doc comment.
    Some(unsafe { core::ptr::read_unaligned(addr as *const u64) })
}
