//! Session orchestrator
//!
//! Owns the peer connection table and is its only writer. One event loop per
//! active session reacts to roster snapshots, inbound signals and peer worker
//! reports. The mesh only exists while the debate is live in video mode:
//! local media and the inbox are opened on entering that state and released
//! on leaving it, while the registry watch lasts until the session is stopped.

use debate_protocol::{DebateState, ParticipantId, SessionId, SignalKind};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::error::{MediaError, MeshError, Result};
use crate::media::{LocalMedia, MediaSource};
use crate::peer::{
    HandshakeState, PeerConnectionTable, PeerEntry, PeerReport, PeerWorker, ReportKind, Role,
    WorkerContext,
};
use crate::relay::{
    InboundSignal, InboxSink, ParticipantRegistry, RelayChannel, RetryingRelay, Subscription,
};
use crate::roster::{Roster, RosterDiff, RosterEvent, RosterTracker};
use crate::transport::{TrackOf, TransportFactory};

/// Callbacks into the UI layer
pub trait SessionObserver<Tr>: Send + Sync + 'static {
    /// A remote track arrived; `tracks` is everything received from `remote` so far
    fn on_remote_stream_added(&self, remote: &ParticipantId, tracks: &[Tr]);

    /// The connection to `remote` is gone; fired once per removed entry
    fn on_remote_stream_removed(&self, remote: &ParticipantId);

    /// Local capture failed; the session continues receive-only
    fn on_media_error(&self, _error: &MediaError) {}

    /// The debate left live video mode and the mesh was torn down; the
    /// session keeps watching and rebuilds the mesh if it goes live again
    fn on_session_ended(&self, _state: &DebateState) {}

    fn on_peer_failed(&self, _remote: &ParticipantId, _reason: &str) {}
}

/// Point-in-time view of one table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub remote: ParticipantId,
    pub role: Role,
    pub state: HandshakeState,
    pub generation: u64,
    pub remote_tracks: usize,
}

enum Command {
    Stop,
    Peers(oneshot::Sender<Vec<PeerSummary>>),
}

struct RunningSession {
    session_id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Drives the full mesh for one local participant
pub struct SessionOrchestrator<F: TransportFactory> {
    config: MeshConfig,
    relay: Arc<dyn RelayChannel>,
    registry: Arc<dyn ParticipantRegistry>,
    factory: Arc<F>,
    observer: Arc<dyn SessionObserver<TrackOf<F>>>,
    running: Option<RunningSession>,
}

impl<F: TransportFactory> SessionOrchestrator<F> {
    pub fn new(
        config: MeshConfig,
        relay: Arc<dyn RelayChannel>,
        registry: Arc<dyn ParticipantRegistry>,
        factory: F,
        observer: Arc<dyn SessionObserver<TrackOf<F>>>,
    ) -> Self {
        // Publish retries happen here and nowhere else
        let relay: Arc<dyn RelayChannel> = Arc::new(RetryingRelay::new(relay, config.retry));
        Self {
            config,
            relay,
            registry,
            factory: Arc::new(factory),
            observer,
            running: None,
        }
    }

    /// True while a session loop is active
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.running.as_ref().map(|running| &running.session_id)
    }

    /// Follow `session_id` as `local_id`.
    ///
    /// A no-op while a session is already running. Only the participant
    /// registry is watched until the debate is live in video mode; local
    /// media and the signaling inbox are opened on that transition and
    /// released again when the debate leaves it. If media acquisition fails
    /// the observer is told and the mesh runs receive-only.
    pub async fn start_session(
        &mut self,
        session_id: SessionId,
        local_id: ParticipantId,
        media_source: Arc<dyn MediaSource>,
    ) -> Result<()> {
        if self.is_running() {
            tracing::debug!("Session already running, ignoring start for {}", session_id);
            return Ok(());
        }
        if let Some(finished) = self.running.take() {
            let _ = finished.task.await;
        }

        tracing::info!("Starting session {} as {}", session_id, local_id);

        let (roster_tx, roster_rx) = mpsc::unbounded_channel();
        let roster = RosterTracker::subscribe(self.registry.clone(), &session_id, roster_tx)
            .await
            .map_err(MeshError::from)?;

        let scope = Scope {
            relay: self.relay.clone(),
            inbox: None,
            roster: Some(roster),
            media_source,
            media: None,
        };

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let session = SessionLoop {
            session_id: session_id.clone(),
            local_id,
            redial_failed_peers: self.config.redial_failed_peers,
            relay: self.relay.clone(),
            factory: self.factory.clone(),
            observer: self.observer.clone(),
            scope,
            inbox_sink: inbox_tx,
            table: PeerConnectionTable::new(),
            state: None,
            live: false,
            roster: None,
            stale: false,
            deferred: Vec::new(),
            next_generation: 0,
            reports: reports_tx,
        };
        let task = tokio::spawn(session.run(commands_rx, roster_rx, inbox_rx, reports_rx));

        self.running = Some(RunningSession {
            session_id,
            commands: commands_tx,
            task,
        });
        Ok(())
    }

    /// Tear down every connection, close all subscriptions and release local media
    pub async fn stop_session(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.commands.send(Command::Stop);
        if let Err(e) = running.task.await {
            tracing::error!("Session loop for {} panicked: {}", running.session_id, e);
        }
        tracing::info!("Stopped session {}", running.session_id);
    }

    /// Current peer table, empty when no session is running
    pub async fn peers(&self) -> Vec<PeerSummary> {
        let Some(running) = self.running.as_ref() else {
            return Vec::new();
        };
        let (tx, rx) = oneshot::channel();
        if running.commands.send(Command::Peers(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Resources opened by one session activation
struct Scope {
    relay: Arc<dyn RelayChannel>,
    inbox: Option<Subscription>,
    roster: Option<RosterTracker>,
    media_source: Arc<dyn MediaSource>,
    media: Option<Arc<LocalMedia>>,
}

impl Scope {
    async fn close_inbox(&mut self) {
        if let Some(inbox) = self.inbox.take() {
            self.relay.unsubscribe(&inbox).await;
        }
    }

    async fn release_media(&mut self) {
        if let Some(media) = self.media.take() {
            self.media_source.release(&media).await;
        }
    }

    async fn close(&mut self) {
        if let Some(roster) = self.roster.take() {
            roster.unsubscribe().await;
        }
        self.close_inbox().await;
        self.release_media().await;
    }
}

struct SessionLoop<F: TransportFactory> {
    session_id: SessionId,
    local_id: ParticipantId,
    redial_failed_peers: bool,
    relay: Arc<dyn RelayChannel>,
    factory: Arc<F>,
    observer: Arc<dyn SessionObserver<TrackOf<F>>>,
    scope: Scope,
    inbox_sink: InboxSink,
    table: PeerConnectionTable<TrackOf<F>>,
    /// Last debate state; None until the registry reports one
    state: Option<DebateState>,
    /// Media and inbox are open and the mesh follows the roster
    live: bool,
    /// Last roster snapshot; None until the first one arrives
    roster: Option<Roster>,
    stale: bool,
    /// Signals held back until the roster is trustworthy again
    deferred: Vec<InboundSignal>,
    next_generation: u64,
    reports: mpsc::UnboundedSender<PeerReport<TrackOf<F>>>,
}

impl<F: TransportFactory> SessionLoop<F> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut roster_events: mpsc::UnboundedReceiver<RosterEvent>,
        mut inbox: mpsc::UnboundedReceiver<InboundSignal>,
        mut reports: mpsc::UnboundedReceiver<PeerReport<TrackOf<F>>>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Peers(reply)) => {
                        let _ = reply.send(self.summaries());
                    }
                    Some(Command::Stop) | None => break,
                },
                Some(event) = roster_events.recv() => match event {
                    RosterEvent::Snapshot(roster) => self.on_snapshot(roster).await,
                    RosterEvent::Stale => self.on_stale(),
                    RosterEvent::SessionState(state) => self.on_state(state, &mut inbox).await,
                },
                Some(report) = reports.recv() => self.on_report(report).await,
                Some(signal) = inbox.recv() => self.route_signal(signal).await,
            }
        }

        self.tear_down_mesh(&mut inbox).await;
        self.scope.close().await;
    }

    async fn on_state(
        &mut self,
        state: DebateState,
        inbox: &mut mpsc::UnboundedReceiver<InboundSignal>,
    ) {
        self.state = Some(state);
        if state.wants_video_mesh() {
            self.go_live().await;
            return;
        }

        if self.live {
            tracing::info!(
                "Session {} is now {:?}/{:?}, tearing down video mesh",
                self.session_id,
                state.status,
                state.mode
            );
            self.tear_down_mesh(inbox).await;
            self.observer.on_session_ended(&state);
        } else {
            tracing::debug!(
                "Session {} is {:?}/{:?}, waiting for live video",
                self.session_id,
                state.status,
                state.mode
            );
        }
    }

    /// Acquire media, open the inbox and connect to the current roster
    async fn go_live(&mut self) {
        if self.live {
            return;
        }

        if self.scope.media.is_none() {
            match self.scope.media_source.acquire().await {
                Ok(media) => self.scope.media = Some(Arc::new(media)),
                Err(e) => {
                    tracing::warn!("Continuing without local media: {}", e);
                    self.observer.on_media_error(&e);
                }
            }
        }

        match self
            .relay
            .subscribe_inbox(&self.session_id, &self.local_id, self.inbox_sink.clone())
            .await
        {
            Ok(subscription) => self.scope.inbox = Some(subscription),
            Err(e) => {
                // Retried on the next registry event
                tracing::error!("Failed to open inbox for {}: {}", self.session_id, e);
                self.scope.release_media().await;
                return;
            }
        }

        tracing::info!("Session {} is live, building video mesh", self.session_id);
        self.live = true;
        self.sync_with_roster().await;
    }

    /// Close every connection, the inbox and local media
    async fn tear_down_mesh(&mut self, inbox: &mut mpsc::UnboundedReceiver<InboundSignal>) {
        self.live = false;
        self.scope.close_inbox().await;
        for entry in self.table.clear().await {
            self.observer.on_remote_stream_removed(entry.remote_id());
        }
        // Unacked signals stay stored and are redelivered when the inbox reopens
        self.deferred.clear();
        while inbox.try_recv().is_ok() {}
        self.scope.release_media().await;
    }

    fn summaries(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self
            .table
            .entries()
            .map(|entry| PeerSummary {
                remote: entry.remote_id().clone(),
                role: entry.role(),
                state: entry.state(),
                generation: entry.generation(),
                remote_tracks: entry.remote_tracks().len(),
            })
            .collect();
        peers.sort_by(|a, b| a.remote.cmp(&b.remote));
        peers
    }

    fn roster_ready(&self) -> bool {
        self.roster.is_some() && !self.stale
    }

    async fn on_snapshot(&mut self, roster: Roster) {
        if self.stale {
            tracing::info!("Participant registry recovered for {}", self.session_id);
        }
        self.stale = false;
        self.roster = Some(roster);

        if self.live {
            self.sync_with_roster().await;
        } else if self.state.is_some_and(|state| state.wants_video_mesh()) {
            self.go_live().await;
        }
    }

    /// Bring the table in line with the roster, then replay deferred signals
    async fn sync_with_roster(&mut self) {
        let Some(roster) = self.roster.as_ref() else {
            return;
        };
        if self.stale {
            return;
        }
        let diff = RosterDiff::compute(roster, self.table.keys(), &self.local_id);

        for id in &diff.to_disconnect {
            tracing::info!("{} left the roster", id);
            self.remove_peer(id).await;
        }
        for id in diff.to_connect {
            self.create_entry(id).await;
        }

        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            tracing::debug!("Replaying {} deferred signals", deferred.len());
        }
        for signal in deferred {
            self.route_signal(signal).await;
        }
    }

    fn on_stale(&mut self) {
        if !self.stale {
            tracing::warn!(
                "{}; keeping {} connections, pausing new ones",
                MeshError::StaleRoster,
                self.table.len()
            );
        }
        self.stale = true;
    }

    async fn create_entry(&mut self, remote: ParticipantId) {
        let role = Role::for_pair(&self.local_id, &remote);
        self.next_generation += 1;
        let generation = self.next_generation;

        let worker = PeerWorker::spawn(
            self.factory.clone(),
            WorkerContext {
                session_id: self.session_id.clone(),
                local_id: self.local_id.clone(),
                remote_id: remote.clone(),
                generation,
                media: self.scope.media.clone(),
                relay: self.relay.clone(),
                reports: self.reports.clone(),
            },
        );
        tracing::info!("Connecting to {} as {}", remote, role);
        self.table
            .upsert(PeerEntry::new(remote, role, generation, worker))
            .await;
    }

    async fn remove_peer(&mut self, id: &ParticipantId) {
        if self.table.remove(id).await.is_some() {
            self.observer.on_remote_stream_removed(id);
        }
    }

    async fn route_signal(&mut self, signal: InboundSignal) {
        let from = signal.message.from.clone();
        let kind = signal.message.kind();

        if !self.live {
            // Left unacked; delivered again when the inbox reopens
            tracing::debug!("Dropping {} from {} received outside live video", kind, from);
            return;
        }

        if signal.message.to != self.local_id || from == self.local_id {
            tracing::warn!("Discarding misaddressed {} from {}", kind, from);
            discard(signal).await;
            return;
        }

        if let Some(entry) = self.table.get(&from) {
            if let Err(signal) = entry.deliver(signal) {
                tracing::debug!("Worker for {} is gone, discarding {}", from, kind);
                discard(signal).await;
            }
            return;
        }

        let follows_deferred = self.deferred.iter().any(|s| s.message.from == from);
        if !self.roster_ready() && (kind == SignalKind::Offer || follows_deferred) {
            tracing::debug!("Deferring {} from {} until the roster is current", kind, from);
            self.deferred.push(signal);
            return;
        }

        match kind {
            SignalKind::Offer if Role::for_pair(&self.local_id, &from) == Role::Responder => {
                self.create_entry(from.clone()).await;
                if let Some(entry) = self.table.get(&from) {
                    if let Err(signal) = entry.deliver(signal) {
                        discard(signal).await;
                    }
                }
            }
            SignalKind::Offer => {
                tracing::warn!("Discarding offer from {}: we initiate towards it", from);
                discard(signal).await;
            }
            _ => {
                tracing::debug!("Discarding {} from {} with no connection", kind, from);
                discard(signal).await;
            }
        }
    }

    async fn on_report(&mut self, report: PeerReport<TrackOf<F>>) {
        let PeerReport {
            remote,
            generation,
            kind,
        } = report;

        let Some(entry) = self.table.get_mut(&remote) else {
            return;
        };
        if entry.generation() != generation {
            tracing::debug!("Ignoring report from replaced entry for {}", remote);
            return;
        }

        match kind {
            ReportKind::State(state) => {
                tracing::debug!("{} is now {}", remote, state);
                entry.set_state(state);
            }
            ReportKind::RemoteTrack(track) => {
                entry.add_remote_track(track);
                self.observer
                    .on_remote_stream_added(&remote, entry.remote_tracks());
            }
            ReportKind::Failed(reason) => {
                tracing::warn!("Connection to {} failed: {}", remote, reason);
                self.remove_peer(&remote).await;
                self.observer.on_peer_failed(&remote, &reason);

                let still_present = self
                    .roster
                    .as_ref()
                    .is_some_and(|roster| roster.contains(&remote));
                if self.redial_failed_peers && still_present && self.live && self.roster_ready() {
                    tracing::info!("Redialing {}", remote);
                    self.create_entry(remote).await;
                }
            }
        }
    }
}

async fn discard(signal: InboundSignal) {
    let signal_id = signal.ack.signal_id();
    if let Err(e) = signal.ack.ack().await {
        tracing::warn!("Failed to ack discarded signal {}: {}", signal_id, e);
    }
}
