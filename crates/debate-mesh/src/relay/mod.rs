//! Relay channel adapter
//!
//! The relay is a shared, per-session store used only to ferry handshake
//! messages between peers. Messages for one recipient are delivered oldest
//! first and stay stored until acked, so delivery is at-least-once.

mod memory;
mod remote;
mod retry;

pub use memory::MemoryRelay;
pub use remote::RemoteRelay;
pub use retry::RetryingRelay;

use async_trait::async_trait;
use debate_protocol::{
    DebateState, ParticipantDocument, ParticipantId, SessionId, SignalId, SignalMessage,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::RelayError;

/// Handle identifying an open push subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
}

impl Subscription {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Deletes one delivered signal from the store
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self, session_id: &SessionId, signal_id: SignalId) -> Result<(), RelayError>;
}

/// One-shot acknowledgement for a delivered signal.
///
/// Dropping it without calling [`Ack::ack`] leaves the signal stored, so it
/// is delivered again when the inbox is next subscribed.
pub struct Ack {
    session_id: SessionId,
    signal_id: SignalId,
    handle: Arc<dyn AckHandle>,
}

impl Ack {
    pub fn new(session_id: SessionId, signal_id: SignalId, handle: Arc<dyn AckHandle>) -> Self {
        Self {
            session_id,
            signal_id,
            handle,
        }
    }

    pub fn signal_id(&self) -> SignalId {
        self.signal_id
    }

    pub async fn ack(self) -> Result<(), RelayError> {
        self.handle.ack(&self.session_id, self.signal_id).await
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("session_id", &self.session_id)
            .field("signal_id", &self.signal_id)
            .finish()
    }
}

/// A signal pushed to an inbox subscription
#[derive(Debug)]
pub struct InboundSignal {
    pub message: SignalMessage,
    pub ack: Ack,
}

pub type InboxSink = mpsc::UnboundedSender<InboundSignal>;

/// Ordered, filtered read access and append access to a session's signaling collection
#[async_trait]
pub trait RelayChannel: Send + Sync + 'static {
    /// Append one message. Messages from one sender to one recipient are
    /// retrievable in publish order.
    async fn publish(
        &self,
        session_id: &SessionId,
        message: &SignalMessage,
    ) -> Result<SignalId, RelayError>;

    /// Push every message addressed to `recipient` into `sink`, oldest first
    async fn subscribe_inbox(
        &self,
        session_id: &SessionId,
        recipient: &ParticipantId,
        sink: InboxSink,
    ) -> Result<Subscription, RelayError>;

    /// Stop delivery; idempotent
    async fn unsubscribe(&self, subscription: &Subscription);
}

/// Event pushed by the participant registry feed
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// Full participant snapshot
    Participants(Vec<ParticipantDocument>),
    /// Debate status or mode changed
    State(DebateState),
    /// Feed interrupted; the last snapshot may be out of date
    Stale,
}

pub type RegistrySink = mpsc::UnboundedSender<RegistryEvent>;

/// Read-only view of a session's participant registry
#[async_trait]
pub trait ParticipantRegistry: Send + Sync + 'static {
    /// Fires once immediately with the current participants and state, then
    /// on every change
    async fn watch(
        &self,
        session_id: &SessionId,
        sink: RegistrySink,
    ) -> Result<Subscription, RelayError>;

    /// Stop delivery; idempotent
    async fn unwatch(&self, subscription: &Subscription);
}

#[async_trait]
impl<T: RelayChannel + ?Sized> RelayChannel for Arc<T> {
    async fn publish(
        &self,
        session_id: &SessionId,
        message: &SignalMessage,
    ) -> Result<SignalId, RelayError> {
        (**self).publish(session_id, message).await
    }

    async fn subscribe_inbox(
        &self,
        session_id: &SessionId,
        recipient: &ParticipantId,
        sink: InboxSink,
    ) -> Result<Subscription, RelayError> {
        (**self).subscribe_inbox(session_id, recipient, sink).await
    }

    async fn unsubscribe(&self, subscription: &Subscription) {
        (**self).unsubscribe(subscription).await
    }
}
