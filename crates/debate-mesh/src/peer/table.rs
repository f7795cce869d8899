use debate_protocol::ParticipantId;
use std::collections::HashMap;

use super::{HandshakeState, PeerWorker, Role};
use crate::relay::InboundSignal;

/// One remote participant's connection as seen by the orchestrator
pub struct PeerEntry<Tr> {
    remote_id: ParticipantId,
    role: Role,
    generation: u64,
    state: HandshakeState,
    remote_tracks: Vec<Tr>,
    worker: PeerWorker,
}

impl<Tr: Clone> PeerEntry<Tr> {
    pub fn new(remote_id: ParticipantId, role: Role, generation: u64, worker: PeerWorker) -> Self {
        Self {
            remote_id,
            role,
            generation,
            state: HandshakeState::Idle,
            remote_tracks: Vec::new(),
            worker,
        }
    }

    pub fn remote_id(&self) -> &ParticipantId {
        &self.remote_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Last state reported by the worker
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn set_state(&mut self, state: HandshakeState) {
        self.state = state;
    }

    pub fn remote_tracks(&self) -> &[Tr] {
        &self.remote_tracks
    }

    pub fn add_remote_track(&mut self, track: Tr) {
        self.remote_tracks.push(track);
    }

    pub fn deliver(&self, signal: InboundSignal) -> Result<(), InboundSignal> {
        self.worker.deliver(signal)
    }

    /// Close the underlying connection; idempotent
    pub async fn close(&mut self) -> bool {
        let closed = self.worker.close().await;
        self.state = HandshakeState::Closed;
        closed
    }
}

/// Map from remote participant to its entry.
///
/// Removal always goes through [`PeerConnectionTable::remove`], which closes
/// the connection, so no entry is ever present with a dead connection or
/// absent with a live one.
pub struct PeerConnectionTable<Tr> {
    entries: HashMap<ParticipantId, PeerEntry<Tr>>,
}

impl<Tr: Clone> Default for PeerConnectionTable<Tr> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Tr: Clone> PeerConnectionTable<Tr> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, closing any entry it replaces
    pub async fn upsert(&mut self, entry: PeerEntry<Tr>) -> bool {
        let replaced = self.entries.insert(entry.remote_id.clone(), entry);
        match replaced {
            Some(mut old) => {
                tracing::debug!("Replacing entry for {}", old.remote_id);
                old.close().await;
                true
            }
            None => false,
        }
    }

    /// Remove and close the entry for `id`
    pub async fn remove(&mut self, id: &ParticipantId) -> Option<PeerEntry<Tr>> {
        let mut entry = self.entries.remove(id)?;
        entry.close().await;
        Some(entry)
    }

    /// Remove and close every entry
    pub async fn clear(&mut self) -> Vec<PeerEntry<Tr>> {
        let mut removed: Vec<PeerEntry<Tr>> = self.entries.drain().map(|(_, entry)| entry).collect();
        for entry in &mut removed {
            entry.close().await;
        }
        removed
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&PeerEntry<Tr>> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut PeerEntry<Tr>> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ParticipantId> {
        self.entries.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PeerEntry<Tr>> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
