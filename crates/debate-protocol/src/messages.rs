use serde::{Deserialize, Serialize};

use crate::types::{
    DebateState, ParticipantDocument, ParticipantId, SessionId, SignalDocument, SignalDraft,
    SignalId,
};

/// Client-chosen id correlating a request with its response
pub type RequestId = u64;

/// Server-assigned id of a push subscription
pub type SubscriptionId = u64;

/// Messages sent from a peer to the relay via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Append a signal to the session's signaling collection
    Publish {
        request_id: RequestId,
        session_id: SessionId,
        signal: SignalDraft,
    },

    /// Receive every signal addressed to `recipient`, oldest first
    SubscribeInbox {
        request_id: RequestId,
        session_id: SessionId,
        recipient: ParticipantId,
    },

    /// Delete a processed signal
    Ack {
        request_id: RequestId,
        session_id: SessionId,
        signal_id: SignalId,
    },

    /// Receive participant snapshots and debate state for a session
    WatchSession {
        request_id: RequestId,
        session_id: SessionId,
    },

    /// Stop a push subscription
    Unsubscribe {
        request_id: RequestId,
        subscription_id: SubscriptionId,
    },

    /// Register `uid` in the session's participant registry
    JoinSession {
        request_id: RequestId,
        session_id: SessionId,
        uid: ParticipantId,
    },

    /// Remove `uid` from the session's participant registry
    LeaveSession {
        request_id: RequestId,
        session_id: SessionId,
        uid: ParticipantId,
    },

    /// Ping to keep connection alive
    Ping,
}

/// Messages sent from the relay to a peer via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Signal stored
    Published {
        request_id: RequestId,
        signal_id: SignalId,
    },

    /// Push subscription opened
    Subscribed {
        request_id: RequestId,
        subscription_id: SubscriptionId,
    },

    /// Ack, unsubscribe, join or leave completed
    Done { request_id: RequestId },

    /// Request failed
    Error {
        request_id: Option<RequestId>,
        message: String,
    },

    /// Signal addressed to an inbox subscription
    Signal {
        subscription_id: SubscriptionId,
        document: SignalDocument,
    },

    /// Full participant snapshot, ordered by join time
    Participants {
        subscription_id: SubscriptionId,
        participants: Vec<ParticipantDocument>,
    },

    /// Debate state changed
    SessionState {
        subscription_id: SubscriptionId,
        state: DebateState,
    },

    /// Pong response to ping
    Pong,
}

impl ServerMessage {
    /// Request id this message answers, if it is a response
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ServerMessage::Published { request_id, .. }
            | ServerMessage::Subscribed { request_id, .. }
            | ServerMessage::Done { request_id } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}
