//! Shared protocol definitions for debate-mesh
//!
//! Types in this crate are used by both the peer-connection manager and the
//! relay service: participant identities, handshake signal documents and the
//! WebSocket protocol spoken between them.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
