//! Shared fixtures for debate-mesh integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use debate_mesh::error::{MediaError, TransportError};
use debate_mesh::media::{LocalMedia, MediaSource};
use debate_mesh::transport::{PeerTransport, TransportEvent, TransportEvents, TransportFactory};
use debate_mesh::{PeerSummary, SessionObserver, SessionOrchestrator};
use debate_protocol::{
    DebateState, IceCandidateInit, ParticipantId, SdpType, SessionDescription, SignalDocument,
    SignalKind,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Remote track handle used by the mock transport
pub type MockTrack = String;

/// Everything a mock transport was asked to do
#[derive(Debug, Default)]
pub struct TransportLog {
    pub remote: ParticipantId,
    pub with_media: bool,
    pub offers_created: usize,
    pub answers_created: usize,
    pub remote_descriptions: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidateInit>,
    /// Ordered trace: "offer", "answer", "remote-offer", "remote-answer", "candidate:<c>"
    pub calls: Vec<String>,
    pub closes: usize,
}

pub struct MockTransport {
    log: Arc<Mutex<TransportLog>>,
    reject_descriptions: bool,
}

#[async_trait]
impl PeerTransport for MockTransport {
    type Track = MockTrack;

    async fn local_offer(&self) -> Result<SessionDescription, TransportError> {
        let mut log = self.log.lock().unwrap();
        log.offers_created += 1;
        log.calls.push("offer".into());
        Ok(SessionDescription::offer(format!(
            "v=0 offer#{} for {}",
            log.offers_created, log.remote
        )))
    }

    async fn local_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut log = self.log.lock().unwrap();
        log.answers_created += 1;
        log.calls.push("answer".into());
        Ok(SessionDescription::answer(format!(
            "v=0 answer#{} for {}",
            log.answers_created, log.remote
        )))
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if self.reject_descriptions {
            return Err(TransportError::InvalidDescription("rejected by mock".into()));
        }
        let mut log = self.log.lock().unwrap();
        let step = match description.sdp_type {
            SdpType::Offer => "remote-offer",
            SdpType::Answer => "remote-answer",
        };
        log.calls.push(step.into());
        log.remote_descriptions.push(description);
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        candidate: IceCandidateInit,
    ) -> Result<(), TransportError> {
        let mut log = self.log.lock().unwrap();
        log.calls.push(format!("candidate:{}", candidate.candidate));
        log.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.log.lock().unwrap().closes += 1;
        Ok(())
    }
}

impl MockTransport {
    /// A transport outside any factory, for driving an engine by hand
    pub fn standalone(remote: &str) -> (Self, Arc<Mutex<TransportLog>>) {
        let log = Arc::new(Mutex::new(TransportLog {
            remote: remote.into(),
            ..Default::default()
        }));
        let transport = Self {
            log: log.clone(),
            reject_descriptions: false,
        };
        (transport, log)
    }

    pub fn rejecting(remote: &str) -> (Self, Arc<Mutex<TransportLog>>) {
        let (mut transport, log) = Self::standalone(remote);
        transport.reject_descriptions = true;
        (transport, log)
    }
}

#[derive(Default)]
struct FactoryState {
    logs: HashMap<ParticipantId, Vec<Arc<Mutex<TransportLog>>>>,
    events: HashMap<ParticipantId, TransportEvents<MockTrack>>,
    reject_descriptions: bool,
}

/// Factory handing out recording transports; clones share state
#[derive(Clone, Default)]
pub struct MockFactory {
    state: Arc<Mutex<FactoryState>>,
}

#[async_trait]
impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    async fn connect(
        &self,
        remote: &ParticipantId,
        media: Option<Arc<LocalMedia>>,
        events: TransportEvents<MockTrack>,
    ) -> Result<MockTransport, TransportError> {
        let log = Arc::new(Mutex::new(TransportLog {
            remote: remote.clone(),
            with_media: media.is_some(),
            ..Default::default()
        }));
        let mut state = self.state.lock().unwrap();
        state.logs.entry(remote.clone()).or_default().push(log.clone());
        state.events.insert(remote.clone(), events);
        Ok(MockTransport {
            log,
            reject_descriptions: state.reject_descriptions,
        })
    }
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports created from now on reject every remote description
    pub fn reject_descriptions(&self) {
        self.state.lock().unwrap().reject_descriptions = true;
    }

    /// Number of transports ever created towards `remote`
    pub fn created(&self, remote: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(&ParticipantId::new(remote))
            .map_or(0, Vec::len)
    }

    /// Inspect the latest transport towards `remote`
    pub fn with_log<T>(&self, remote: &str, f: impl FnOnce(&TransportLog) -> T) -> Option<T> {
        let log = self
            .state
            .lock()
            .unwrap()
            .logs
            .get(&ParticipantId::new(remote))?
            .last()?
            .clone();
        let log = log.lock().unwrap();
        Some(f(&log))
    }

    /// Close calls summed over every transport towards `remote`
    pub fn closes(&self, remote: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(&ParticipantId::new(remote))
            .map_or(0, |logs| logs.iter().map(|l| l.lock().unwrap().closes).sum())
    }

    /// Fire a transport callback on the latest transport towards `remote`
    pub fn emit(&self, remote: &str, event: TransportEvent<MockTrack>) {
        let state = self.state.lock().unwrap();
        let sink = state
            .events
            .get(&ParticipantId::new(remote))
            .expect("no transport for remote");
        sink.send(event).expect("worker gone");
    }
}

/// Media source counting acquisitions and releases
#[derive(Default)]
pub struct MockMediaSource {
    pub deny: bool,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl MockMediaSource {
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Default::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        if self.deny {
            return Err(MediaError::Denied("camera blocked".into()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMedia::new(None, None))
    }

    async fn release(&self, media: &LocalMedia) {
        media.stop();
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    StreamAdded(ParticipantId, usize),
    StreamRemoved(ParticipantId),
    MediaError,
    SessionEnded(DebateState),
    PeerFailed(ParticipantId),
}

/// Observer recording every callback in order
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().unwrap().clone()
    }

    pub fn removed(&self, remote: &str) -> usize {
        let remote = ParticipantId::new(remote);
        self.events()
            .iter()
            .filter(|e| matches!(e, Observed::StreamRemoved(id) if *id == remote))
            .count()
    }

    fn push(&self, event: Observed) {
        self.events.lock().unwrap().push(event);
    }
}

impl SessionObserver<MockTrack> for RecordingObserver {
    fn on_remote_stream_added(&self, remote: &ParticipantId, tracks: &[MockTrack]) {
        self.push(Observed::StreamAdded(remote.clone(), tracks.len()));
    }

    fn on_remote_stream_removed(&self, remote: &ParticipantId) {
        self.push(Observed::StreamRemoved(remote.clone()));
    }

    fn on_media_error(&self, _error: &MediaError) {
        self.push(Observed::MediaError);
    }

    fn on_session_ended(&self, state: &DebateState) {
        self.push(Observed::SessionEnded(*state));
    }

    fn on_peer_failed(&self, remote: &ParticipantId, _reason: &str) {
        self.push(Observed::PeerFailed(remote.clone()));
    }
}

/// Poll `check` until it holds, failing the test after two seconds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Poll the orchestrator's table until `check` holds
pub async fn wait_for_peers<F>(
    orchestrator: &SessionOrchestrator<F>,
    what: &str,
    check: impl Fn(&[PeerSummary]) -> bool,
) -> Vec<PeerSummary>
where
    F: TransportFactory,
{
    let mut last = Vec::new();
    for _ in 0..200 {
        last = orchestrator.peers().await;
        if check(&last) {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}; table was {:?}", what, last);
}

/// Stored signals of `kind` from `from` to `to`
pub fn signals(
    documents: &[SignalDocument],
    kind: SignalKind,
    from: &str,
    to: &str,
) -> Vec<SignalDocument> {
    documents
        .iter()
        .filter(|d| d.draft.kind == kind && d.draft.from.as_str() == from && d.draft.to.as_str() == to)
        .cloned()
        .collect()
}
