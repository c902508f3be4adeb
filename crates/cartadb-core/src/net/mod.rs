//! Peer networking: identities, wire messages, the RPC hub.

pub mod hub;
pub mod message;
pub mod peer;

pub use hub::{Handler, PeerHub};
pub use message::{Envelope, Reply, Request, Response};
pub use peer::PeerId;
