//! Core identifier types for EmberDB.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Log Sequence Number - a byte position in the logical redo log stream.
///
/// LSNs are monotonically non-decreasing and are used to:
/// - Order redo log records
/// - Track write and flush progress
/// - Implement checkpointing
///
/// LSN 0 is reserved; the log stream starts at a non-zero constant so that
/// every record has a start LSN distinguishable from "no LSN".
///
/// # Example
///
/// ```rust
/// use ember_common::types::Lsn;
///
/// let lsn = Lsn::new(1000);
/// assert!(lsn > Lsn::INVALID);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// Invalid LSN, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// Maximum LSN value.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a new `Lsn` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the LSN advanced by the given number of bytes.
    #[inline]
    #[must_use]
    pub const fn offset(self, delta: u64) -> Self {
        Self(self.0.saturating_add(delta))
    }

    /// Checks if this is a valid LSN.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns the difference between two LSNs, saturating at zero.
    #[inline]
    #[must_use]
    pub const fn diff(self, other: Self) -> u64 {
        self.0.saturating_sub(other.0)
    }

    /// Creates an Lsn from bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Converts to bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Lsn(INVALID)")
        } else {
            write!(f, "Lsn({})", self.0)
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Lsn {
    #[inline]
    fn from(lsn: u64) -> Self {
        Self::new(lsn)
    }
}

impl From<Lsn> for u64 {
    #[inline]
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_validity() {
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn::new(1).is_valid());
        assert!(Lsn::MAX.is_valid());
    }

    #[test]
    fn test_lsn_ordering() {
        let a = Lsn::new(100);
        let b = Lsn::new(200);
        assert!(a < b);
        assert!(b < Lsn::MAX);
        assert!(Lsn::INVALID < a);
    }

    #[test]
    fn test_lsn_arithmetic() {
        let lsn = Lsn::new(1000);
        assert_eq!(lsn.offset(24), Lsn::new(1024));
        assert_eq!(lsn.offset(24).diff(lsn), 24);
        assert_eq!(lsn.diff(lsn.offset(24)), 0);
    }

    #[test]
    fn test_lsn_byte_roundtrip() {
        let lsn = Lsn::new(0x0123_4567_89ab_cdef);
        assert_eq!(Lsn::from_be_bytes(lsn.to_be_bytes()), lsn);
    }

    #[test]
    fn test_lsn_display() {
        assert_eq!(Lsn::new(8192).to_string(), "8192");
        assert_eq!(format!("{:?}", Lsn::INVALID), "Lsn(INVALID)");
    }
}
