//! 128-bit identifiers for records, chunks and transactions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable 128-bit identifier. Set at creation, never changed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Id(pub u128);

impl Id {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        let hi = fastrand::u64(..) as u128;
        let lo = fastrand::u64(..) as u128;
        Id((hi << 64) | lo)
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        u128::from_str_radix(s, 16).ok().map(Id)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_valid_and_distinct() {
        let a = Id::generate();
        let b = Id::generate();
        assert!(a.is_valid());
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_round_trip() {
        let id = Id::generate();
        assert_eq!(Id::from_hex(&id.to_hex()), Some(id));
    }

    #[test]
    fn test_hex_is_fixed_width() {
        assert_eq!(Id(0x3E1A1AB7E).to_hex().len(), 32);
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert_eq!(Id::from_hex("not-hex"), None);
    }
}
