//! Peer identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a peer: its advertised `host:port` address.
///
/// The derived ordering (lexicographic on the address) is load-bearing: the
/// legacy lock protocol contacts peers in ascending id order and breaks ties
/// by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(address: impl Into<String>) -> Self {
        PeerId(address.into())
    }

    pub fn address(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(address: &str) -> Self {
        PeerId(address.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = PeerId::new("127.0.0.1:7000");
        let b = PeerId::new("127.0.0.1:7001");
        assert!(a < b);
    }

    #[test]
    fn test_serde_is_transparent() {
        let peer = PeerId::new("10.0.0.1:9");
        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(json, "\"10.0.0.1:9\"");
        assert_eq!(serde_json::from_str::<PeerId>(&json).unwrap(), peer);
    }
}
