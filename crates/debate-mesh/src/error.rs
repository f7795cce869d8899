use debate_protocol::{ParticipantId, ProtocolError};
use thiserror::Error;

/// Failures of the relay channel or participant registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Network or store failure; the operation may succeed if retried
    #[error("relay temporarily unavailable: {0}")]
    Transient(String),

    /// The relay connection is gone for good
    #[error("relay connection closed")]
    Closed,

    /// The relay refused the request
    #[error("relay rejected request: {0}")]
    Rejected(String),
}

impl RelayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Transient(_))
    }
}

/// Failures reported by the underlying peer transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("transport already closed")]
    Closed,
}

/// Camera / microphone acquisition failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("media access denied: {0}")]
    Denied(String),

    #[error("no capture device available")]
    Unavailable,
}

/// A description or candidate could not be negotiated
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("transport rejected {step} for {remote}: {source}")]
    Transport {
        remote: ParticipantId,
        step: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("unexpected {kind} from {remote} while {state}")]
    UnexpectedSignal {
        remote: ParticipantId,
        kind: debate_protocol::SignalKind,
        state: crate::peer::HandshakeState,
    },
}

/// Errors surfaced by the mesh library
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("transient relay failure: {0}")]
    TransientIo(RelayError),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("local media unavailable: {0}")]
    MediaAcquisition(#[from] MediaError),

    #[error("participant registry feed interrupted")]
    StaleRoster,

    #[error("relay error: {0}")]
    Relay(RelayError),

    #[error("malformed signal: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<RelayError> for MeshError {
    fn from(err: RelayError) -> Self {
        if err.is_transient() {
            MeshError::TransientIo(err)
        } else {
            MeshError::Relay(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
