//! Pairwise peer connections
//!
//! A [`HandshakeEngine`] negotiates one connection; a [`PeerWorker`] runs it
//! on its own task; the [`PeerConnectionTable`] owns every live entry.

mod engine;
mod table;
mod worker;

pub use engine::{EngineUpdate, HandshakeEngine};
pub use table::{PeerConnectionTable, PeerEntry};
pub use worker::{PeerReport, PeerWorker, ReportKind, WorkerContext};

use debate_protocol::ParticipantId;
use std::fmt;

/// Negotiation state of one pairwise connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Idle,
    OfferSent,
    AwaitingOffer,
    AnswerExchanged,
    Connected,
    Failed,
    Closed,
}

impl HandshakeState {
    /// Failed and Closed accept no further negotiation
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Failed | HandshakeState::Closed)
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Idle => "idle",
            HandshakeState::OfferSent => "offer-sent",
            HandshakeState::AwaitingOffer => "awaiting-offer",
            HandshakeState::AnswerExchanged => "answer-exchanged",
            HandshakeState::Connected => "connected",
            HandshakeState::Failed => "failed",
            HandshakeState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which side of a pair creates the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The lexicographically smaller id initiates
    pub fn for_pair(local: &ParticipantId, remote: &ParticipantId) -> Self {
        if local < remote {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}
