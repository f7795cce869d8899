//! Roster tracking
//!
//! Turns the participant registry feed into full roster snapshots and
//! computes the connect / disconnect sets the orchestrator acts on.

use debate_protocol::{DebateState, ParticipantDocument, ParticipantId, SessionId};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::RelayError;
use crate::relay::{ParticipantRegistry, RegistryEvent, Subscription};

/// Set of participant ids currently registered in a session
pub type Roster = BTreeSet<ParticipantId>;

/// Event forwarded to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum RosterEvent {
    Snapshot(Roster),
    Stale,
    SessionState(DebateState),
}

/// Build a roster from registry documents; blank ids are ignored
pub fn roster_from_documents(documents: &[ParticipantDocument]) -> Roster {
    documents
        .iter()
        .filter(|doc| !doc.uid.is_empty())
        .map(|doc| doc.uid.clone())
        .collect()
}

/// Result of diffing a roster snapshot against the peer table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDiff {
    pub to_connect: Vec<ParticipantId>,
    pub to_disconnect: Vec<ParticipantId>,
}

impl RosterDiff {
    /// `to_connect = roster - known - {self}`, `to_disconnect = known - roster`
    pub fn compute<'a>(
        roster: &Roster,
        known: impl IntoIterator<Item = &'a ParticipantId>,
        local_id: &ParticipantId,
    ) -> Self {
        let known: BTreeSet<&ParticipantId> = known.into_iter().collect();

        let to_connect = roster
            .iter()
            .filter(|id| *id != local_id && !known.contains(id))
            .cloned()
            .collect();

        let to_disconnect = known
            .into_iter()
            .filter(|id| !roster.contains(*id))
            .cloned()
            .collect();

        Self {
            to_connect,
            to_disconnect,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_connect.is_empty() && self.to_disconnect.is_empty()
    }
}

/// Filters registry events into roster events.
///
/// Consecutive identical snapshots are collapsed, except the first snapshot
/// after a stale period which is always forwarded so recovery is observed.
#[derive(Debug, Default)]
struct SnapshotFilter {
    last: Option<Roster>,
    stale: bool,
}

impl SnapshotFilter {
    fn apply(&mut self, event: RegistryEvent) -> Option<RosterEvent> {
        match event {
            RegistryEvent::Participants(documents) => {
                let roster = roster_from_documents(&documents);
                let unchanged = self.last.as_ref() == Some(&roster);
                if unchanged && !self.stale {
                    return None;
                }
                self.stale = false;
                self.last = Some(roster.clone());
                Some(RosterEvent::Snapshot(roster))
            }
            RegistryEvent::Stale => {
                if self.stale {
                    return None;
                }
                self.stale = true;
                Some(RosterEvent::Stale)
            }
            RegistryEvent::State(state) => Some(RosterEvent::SessionState(state)),
        }
    }
}

/// Live subscription to a session's participant registry
pub struct RosterTracker {
    registry: Arc<dyn ParticipantRegistry>,
    subscription: Subscription,
    pump: JoinHandle<()>,
}

impl RosterTracker {
    /// Subscribe to `session_id`; roster events are pushed into `events`
    pub async fn subscribe(
        registry: Arc<dyn ParticipantRegistry>,
        session_id: &SessionId,
        events: mpsc::UnboundedSender<RosterEvent>,
    ) -> Result<Self, RelayError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = registry.watch(session_id, tx).await?;

        let session = session_id.clone();
        let pump = tokio::spawn(async move {
            let mut filter = SnapshotFilter::default();
            while let Some(event) = rx.recv().await {
                if let Some(event) = filter.apply(event) {
                    if let RosterEvent::Snapshot(roster) = &event {
                        tracing::debug!("Roster for {}: {} participants", session, roster.len());
                    }
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
            // Registry sink dropped: the feed is gone
            let _ = events.send(RosterEvent::Stale);
        });

        Ok(Self {
            registry,
            subscription,
            pump,
        })
    }

    pub async fn unsubscribe(self) {
        self.pump.abort();
        self.registry.unwatch(&self.subscription).await;
    }
}
