//! In-process relay store
//!
//! Implements both the signaling collection and the participant registry
//! without any network. Used for embedding and tests; supports fault
//! injection for publish failures and registry interruptions.

use async_trait::async_trait;
use chrono::Utc;
use debate_protocol::{
    DebateState, ParticipantDocument, ParticipantId, SessionId, SignalDocument, SignalId,
    SignalMessage,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    Ack, AckHandle, InboundSignal, InboxSink, ParticipantRegistry, RegistryEvent, RegistrySink,
    RelayChannel, Subscription,
};
use crate::error::RelayError;

#[derive(Default)]
struct SessionData {
    /// Stored signals keyed by creation order
    signals: BTreeMap<u64, SignalDocument>,
    participants: Vec<ParticipantDocument>,
    state: DebateState,
}

struct InboxSubscription {
    session_id: SessionId,
    recipient: ParticipantId,
    sink: InboxSink,
}

struct RegistryWatcher {
    session_id: SessionId,
    sink: RegistrySink,
}

#[derive(Default)]
struct Store {
    next_seq: u64,
    next_subscription: u64,
    sessions: HashMap<SessionId, SessionData>,
    inboxes: HashMap<u64, InboxSubscription>,
    watchers: HashMap<u64, RegistryWatcher>,
    failing_publishes: u32,
    registry_interrupted: bool,
    publish_count: u64,
}

impl Store {
    fn session(&mut self, session_id: &SessionId) -> &mut SessionData {
        self.sessions.entry(session_id.clone()).or_default()
    }

    fn next_subscription_id(&mut self) -> u64 {
        self.next_subscription += 1;
        self.next_subscription
    }

    fn notify_participants(&mut self, session_id: &SessionId) {
        if self.registry_interrupted {
            return;
        }
        let snapshot = self.session(session_id).participants.clone();
        self.watchers.retain(|_, watcher| {
            if &watcher.session_id != session_id {
                return true;
            }
            watcher
                .sink
                .send(RegistryEvent::Participants(snapshot.clone()))
                .is_ok()
        });
    }

    fn notify_state(&mut self, session_id: &SessionId) {
        if self.registry_interrupted {
            return;
        }
        let state = self.session(session_id).state;
        self.watchers.retain(|_, watcher| {
            if &watcher.session_id != session_id {
                return true;
            }
            watcher.sink.send(RegistryEvent::State(state)).is_ok()
        });
    }
}

/// Relay store living in the current process
#[derive(Clone, Default)]
pub struct MemoryRelay {
    store: Arc<Mutex<Store>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(
        &self,
        session_id: &SessionId,
        document: &SignalDocument,
        sink: &InboxSink,
    ) -> bool {
        let message = match document.clone().into_message() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed signal {}: {}", document.id, e);
                return true;
            }
        };
        let ack = Ack::new(session_id.clone(), document.id, Arc::new(self.clone()));
        sink.send(InboundSignal { message, ack }).is_ok()
    }

    /// Register a participant in the session registry
    pub fn join(&self, session_id: &SessionId, uid: &ParticipantId) {
        let mut store = self.lock();
        let session = store.session(session_id);
        if session.participants.iter().any(|p| &p.uid == uid) {
            return;
        }
        session.participants.push(ParticipantDocument {
            uid: uid.clone(),
            joined_at: Utc::now(),
        });
        store.notify_participants(session_id);
    }

    /// Remove a participant from the session registry
    pub fn leave(&self, session_id: &SessionId, uid: &ParticipantId) {
        let mut store = self.lock();
        store.session(session_id).participants.retain(|p| &p.uid != uid);
        store.notify_participants(session_id);
    }

    /// Update the debate status / mode
    pub fn set_state(&self, session_id: &SessionId, state: DebateState) {
        let mut store = self.lock();
        store.session(session_id).state = state;
        store.notify_state(session_id);
    }

    /// Signals still stored (not yet acked), oldest first
    pub fn pending_signals(&self, session_id: &SessionId) -> Vec<SignalDocument> {
        let mut store = self.lock();
        store.session(session_id).signals.values().cloned().collect()
    }

    /// Total number of successful publishes
    pub fn publish_count(&self) -> u64 {
        self.lock().publish_count
    }

    /// Make the next `count` publishes fail with a transient error
    pub fn fail_next_publishes(&self, count: u32) {
        self.lock().failing_publishes = count;
    }

    /// Simulate an interrupted registry feed
    pub fn interrupt_registry(&self) {
        let mut store = self.lock();
        store.registry_interrupted = true;
        store
            .watchers
            .retain(|_, watcher| watcher.sink.send(RegistryEvent::Stale).is_ok());
    }

    /// Resume the registry feed, pushing fresh participants and state to every watcher
    pub fn restore_registry(&self) {
        let mut store = self.lock();
        store.registry_interrupted = false;
        let sessions: Vec<SessionId> = store
            .watchers
            .values()
            .map(|w| w.session_id.clone())
            .collect();
        for session_id in sessions {
            store.notify_participants(&session_id);
            store.notify_state(&session_id);
        }
    }

    /// Push every stored signal to its recipient's subscriptions again, as a
    /// restarted listener would see them
    pub fn redeliver_pending(&self) {
        let store = self.lock();
        let mut targets = Vec::new();
        for inbox in store.inboxes.values() {
            if let Some(session) = store.sessions.get(&inbox.session_id) {
                for doc in session.signals.values() {
                    if doc.draft.to == inbox.recipient {
                        targets.push((inbox.session_id.clone(), doc.clone(), inbox.sink.clone()));
                    }
                }
            }
        }
        drop(store);

        for (session_id, doc, sink) in targets {
            self.deliver(&session_id, &doc, &sink);
        }
    }
}

#[async_trait]
impl AckHandle for MemoryRelay {
    async fn ack(&self, session_id: &SessionId, signal_id: SignalId) -> Result<(), RelayError> {
        let mut store = self.lock();
        store
            .session(session_id)
            .signals
            .retain(|_, doc| doc.id != signal_id);
        Ok(())
    }
}

#[async_trait]
impl RelayChannel for MemoryRelay {
    async fn publish(
        &self,
        session_id: &SessionId,
        message: &SignalMessage,
    ) -> Result<SignalId, RelayError> {
        let (document, sinks) = {
            let mut store = self.lock();
            if store.failing_publishes > 0 {
                store.failing_publishes -= 1;
                return Err(RelayError::Transient("injected publish failure".into()));
            }

            store.next_seq += 1;
            store.publish_count += 1;
            let document = SignalDocument {
                id: Uuid::new_v4(),
                draft: message.to_draft(),
                created_at: Utc::now(),
                seq: store.next_seq,
            };
            store
                .session(session_id)
                .signals
                .insert(document.seq, document.clone());

            let sinks: Vec<InboxSink> = store
                .inboxes
                .values()
                .filter(|inbox| &inbox.session_id == session_id && inbox.recipient == message.to)
                .map(|inbox| inbox.sink.clone())
                .collect();
            (document, sinks)
        };

        for sink in &sinks {
            self.deliver(session_id, &document, sink);
        }

        tracing::debug!(
            "Stored {} signal {} -> {} (seq {})",
            message.kind(),
            message.from,
            message.to,
            document.seq
        );
        Ok(document.id)
    }

    async fn subscribe_inbox(
        &self,
        session_id: &SessionId,
        recipient: &ParticipantId,
        sink: InboxSink,
    ) -> Result<Subscription, RelayError> {
        let (id, backlog) = {
            let mut store = self.lock();
            let id = store.next_subscription_id();
            let backlog: Vec<SignalDocument> = store
                .session(session_id)
                .signals
                .values()
                .filter(|doc| &doc.draft.to == recipient)
                .cloned()
                .collect();
            store.inboxes.insert(
                id,
                InboxSubscription {
                    session_id: session_id.clone(),
                    recipient: recipient.clone(),
                    sink: sink.clone(),
                },
            );
            (id, backlog)
        };

        for doc in &backlog {
            self.deliver(session_id, doc, &sink);
        }

        Ok(Subscription::new(id))
    }

    async fn unsubscribe(&self, subscription: &Subscription) {
        self.lock().inboxes.remove(&subscription.id());
    }
}

#[async_trait]
impl ParticipantRegistry for MemoryRelay {
    async fn watch(
        &self,
        session_id: &SessionId,
        sink: RegistrySink,
    ) -> Result<Subscription, RelayError> {
        let mut store = self.lock();
        let id = store.next_subscription_id();
        let session = store.session(session_id);
        let participants = session.participants.clone();
        let state = session.state;

        if store.registry_interrupted {
            let _ = sink.send(RegistryEvent::Stale);
        } else {
            let _ = sink.send(RegistryEvent::Participants(participants));
            let _ = sink.send(RegistryEvent::State(state));
        }

        store.watchers.insert(
            id,
            RegistryWatcher {
                session_id: session_id.clone(),
                sink,
            },
        );
        Ok(Subscription::new(id))
    }

    async fn unwatch(&self, subscription: &Subscription) {
        self.lock().watchers.remove(&subscription.id());
    }
}
