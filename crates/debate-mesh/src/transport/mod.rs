//! Underlying peer transport
//!
//! The handshake engine drives a transport through this trait; the WebRTC
//! implementation lives in [`rtc`]. Transport callbacks never hold the
//! connection itself; they push [`TransportEvent`]s into a sink owned by the
//! engine's worker.

mod rtc;

pub use rtc::{RtcTransport, RtcTransportFactory};

use async_trait::async_trait;
use debate_protocol::{IceCandidateInit, ParticipantId, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::media::LocalMedia;

/// Connectivity as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notification from a transport
#[derive(Debug, Clone)]
pub enum TransportEvent<Tr> {
    /// A local ICE candidate was discovered
    LocalCandidate(IceCandidateInit),
    /// Connectivity changed
    Link(LinkState),
    /// A remote media track arrived
    RemoteTrack(Tr),
}

pub type TransportEvents<Tr> = mpsc::UnboundedSender<TransportEvent<Tr>>;

/// One native peer connection, exclusively owned by its handshake engine
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Remote media track handle handed to the UI layer
    type Track: Clone + Send + Sync + 'static;

    /// Create an offer and install it as the local description
    async fn local_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Create an answer and install it as the local description
    async fn local_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: IceCandidateInit)
    -> Result<(), TransportError>;

    /// Release the connection
    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds one transport per peer entry
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: PeerTransport;

    /// Create a transport towards `remote`, attaching `media` tracks when present
    async fn connect(
        &self,
        remote: &ParticipantId,
        media: Option<Arc<LocalMedia>>,
        events: TransportEvents<<Self::Transport as PeerTransport>::Track>,
    ) -> Result<Self::Transport, TransportError>;
}

/// Remote track type produced by a factory's transports
pub type TrackOf<F> = <<F as TransportFactory>::Transport as PeerTransport>::Track;
