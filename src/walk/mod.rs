//! Frame-pointer-chasing fallback, used by [`crate::cursor`] when a module
//! has no usable CFI at all.

pub(crate) mod fp;
