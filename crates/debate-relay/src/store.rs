//! In-memory relay store
//!
//! Per session: the signaling collection (a work queue keyed by creation
//! order), the participant registry and the debate state. Push subscriptions
//! receive [`ServerMessage`]s on the owning connection's outbound channel.
//!
//! Lock order is always `sessions` then `subscriptions`.

use chrono::Utc;
use debate_protocol::{
    DebateState, ParticipantDocument, ParticipantId, ServerMessage, SessionId, SignalDocument,
    SignalDraft, SignalId, SubscriptionId,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::error::{AppError, Result};

pub type PushSink = mpsc::UnboundedSender<ServerMessage>;

#[derive(Default)]
struct SessionData {
    signals: BTreeMap<u64, SignalDocument>,
    participants: Vec<ParticipantDocument>,
    state: DebateState,
}

enum Subscription {
    Inbox {
        session_id: SessionId,
        recipient: ParticipantId,
        sink: PushSink,
    },
    Watch {
        session_id: SessionId,
        sink: PushSink,
    },
}

/// Public view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub participants: Vec<ParticipantDocument>,
    pub state: DebateState,
    pub pending_signals: usize,
}

#[derive(Default)]
pub struct RelayStore {
    sessions: RwLock<HashMap<SessionId, SessionData>>,
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    next_seq: AtomicU64,
    next_subscription: AtomicU64,
}

impl RelayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id; the caller announces it before opening the subscription
    pub fn allocate_subscription(&self) -> SubscriptionId {
        self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Append a signal and push it to the recipient's inbox subscriptions
    pub async fn publish(&self, session_id: &SessionId, draft: SignalDraft) -> Result<SignalId> {
        draft
            .clone()
            .into_message(None)
            .map_err(|e| AppError::BadRequest(e.to_string()))?;

        let mut sessions = self.sessions.write().await;
        let document = SignalDocument {
            id: Uuid::new_v4(),
            draft,
            created_at: Utc::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed) + 1,
        };
        sessions
            .entry(session_id.clone())
            .or_default()
            .signals
            .insert(document.seq, document.clone());

        let subscriptions = self.subscriptions.read().await;
        for (id, subscription) in subscriptions.iter() {
            if let Subscription::Inbox {
                session_id: inbox_session,
                recipient,
                sink,
            } = subscription
            {
                if inbox_session == session_id && *recipient == document.draft.to {
                    let _ = sink.send(ServerMessage::Signal {
                        subscription_id: *id,
                        document: document.clone(),
                    });
                }
            }
        }

        tracing::debug!(
            "Stored {} from {} to {} in {}",
            document.draft.kind,
            document.draft.from,
            document.draft.to,
            session_id
        );
        Ok(document.id)
    }

    /// Open an inbox subscription and push the stored backlog oldest first
    pub async fn open_inbox(
        &self,
        subscription_id: SubscriptionId,
        session_id: &SessionId,
        recipient: &ParticipantId,
        sink: PushSink,
    ) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(session_id.clone()).or_default();
        for document in session.signals.values() {
            if &document.draft.to == recipient {
                let _ = sink.send(ServerMessage::Signal {
                    subscription_id,
                    document: document.clone(),
                });
            }
        }

        self.subscriptions.write().await.insert(
            subscription_id,
            Subscription::Inbox {
                session_id: session_id.clone(),
                recipient: recipient.clone(),
                sink,
            },
        );
        tracing::debug!("Inbox of {} in {} opened as {}", recipient, session_id, subscription_id);
    }

    /// Open a registry watch; pushes the current participants and state immediately
    pub async fn open_watch(
        &self,
        subscription_id: SubscriptionId,
        session_id: &SessionId,
        sink: PushSink,
    ) {
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(session_id.clone()).or_default();
        let _ = sink.send(ServerMessage::Participants {
            subscription_id,
            participants: session.participants.clone(),
        });
        let _ = sink.send(ServerMessage::SessionState {
            subscription_id,
            state: session.state,
        });

        self.subscriptions.write().await.insert(
            subscription_id,
            Subscription::Watch {
                session_id: session_id.clone(),
                sink,
            },
        );
    }

    /// Delete a processed signal; false if it was already gone
    pub async fn ack(&self, session_id: &SessionId, signal_id: SignalId) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        let before = session.signals.len();
        session.signals.retain(|_, document| document.id != signal_id);
        session.signals.len() != before
    }

    pub async fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        self.subscriptions
            .write()
            .await
            .remove(&subscription_id)
            .is_some()
    }

    pub async fn unsubscribe_all(&self, subscription_ids: &[SubscriptionId]) {
        let mut subscriptions = self.subscriptions.write().await;
        for id in subscription_ids {
            subscriptions.remove(id);
        }
    }

    /// Register a participant; joining twice keeps the original join time
    pub async fn join(&self, session_id: &SessionId, uid: ParticipantId) -> Result<ParticipantDocument> {
        if uid.is_empty() {
            return Err(AppError::BadRequest("uid must not be empty".into()));
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(session_id.clone()).or_default();
        if let Some(existing) = session.participants.iter().find(|p| p.uid == uid) {
            return Ok(existing.clone());
        }

        let document = ParticipantDocument {
            uid,
            joined_at: Utc::now(),
        };
        session.participants.push(document.clone());
        tracing::info!("{} joined {}", document.uid, session_id);

        let participants = session.participants.clone();
        self.push_to_watchers(session_id, |subscription_id| ServerMessage::Participants {
            subscription_id,
            participants: participants.clone(),
        })
        .await;
        Ok(document)
    }

    /// Remove a participant; false if it was not registered
    pub async fn leave(&self, session_id: &SessionId, uid: &ParticipantId) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return false;
        };
        let before = session.participants.len();
        session.participants.retain(|p| &p.uid != uid);
        if session.participants.len() == before {
            return false;
        }
        tracing::info!("{} left {}", uid, session_id);

        let participants = session.participants.clone();
        self.push_to_watchers(session_id, |subscription_id| ServerMessage::Participants {
            subscription_id,
            participants: participants.clone(),
        })
        .await;
        true
    }

    pub async fn set_state(&self, session_id: &SessionId, state: DebateState) {
        let mut sessions = self.sessions.write().await;
        sessions.entry(session_id.clone()).or_default().state = state;
        tracing::info!(
            "{} is now {:?}/{:?}",
            session_id,
            state.status,
            state.mode
        );

        self.push_to_watchers(session_id, |subscription_id| ServerMessage::SessionState {
            subscription_id,
            state,
        })
        .await;
    }

    pub async fn snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id)?;
        Some(SessionSnapshot {
            session_id: session_id.clone(),
            participants: session.participants.clone(),
            state: session.state,
            pending_signals: session.signals.len(),
        })
    }

    // Callers hold the sessions lock so pushes stay ordered with the data
    async fn push_to_watchers(
        &self,
        session_id: &SessionId,
        message: impl Fn(SubscriptionId) -> ServerMessage,
    ) {
        let subscriptions = self.subscriptions.read().await;
        for (id, subscription) in subscriptions.iter() {
            if let Subscription::Watch {
                session_id: watched,
                sink,
            } = subscription
            {
                if watched == session_id {
                    let _ = sink.send(message(*id));
                }
            }
        }
    }
}
