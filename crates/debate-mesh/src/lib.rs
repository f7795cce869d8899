//! Debate mesh library
//!
//! Peer-connection lifecycle manager for full-mesh debate video sessions:
//! discovers participants, negotiates one WebRTC connection per remote
//! participant over a shared signaling relay, and tears connections down as
//! participants leave or the debate ends.

pub mod config;
pub mod error;
pub mod media;
pub mod orchestrator;
pub mod peer;
pub mod relay;
pub mod roster;
pub mod transport;

pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use orchestrator::{PeerSummary, SessionObserver, SessionOrchestrator};
pub use peer::{HandshakeState, Role};
