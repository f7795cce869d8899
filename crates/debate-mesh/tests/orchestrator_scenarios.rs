mod common;

use common::{
    MockFactory, MockMediaSource, Observed, RecordingObserver, eventually, signals, wait_for_peers,
};
use debate_mesh::config::RetryPolicy;
use debate_mesh::relay::{MemoryRelay, RelayChannel};
use debate_mesh::transport::{LinkState, TransportEvent};
use debate_mesh::{HandshakeState, MeshConfig, Role, SessionOrchestrator};
use debate_protocol::{
    DebateMode, DebateState, DebateStatus, IceCandidateInit, ParticipantId, SessionDescription,
    SessionId, SignalKind, SignalMessage, SignalPayload,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    relay: MemoryRelay,
    session: SessionId,
    factory: MockFactory,
    observer: Arc<RecordingObserver>,
    media: Arc<MockMediaSource>,
    orchestrator: SessionOrchestrator<MockFactory>,
}

fn test_config() -> MeshConfig {
    MeshConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        },
        ..Default::default()
    }
}

impl Harness {
    fn new(local: &str, config: MeshConfig, media: MockMediaSource) -> Self {
        let relay = MemoryRelay::new();
        let session = SessionId::new("debate-1");
        relay.set_state(&session, DebateState::live_video());
        relay.join(&session, &local.into());

        let factory = MockFactory::new();
        let observer = Arc::new(RecordingObserver::default());
        let shared = Arc::new(relay.clone());
        let orchestrator = SessionOrchestrator::new(
            config,
            shared.clone(),
            shared,
            factory.clone(),
            observer.clone(),
        );

        Self {
            relay,
            session,
            factory,
            observer,
            media: Arc::new(media),
            orchestrator,
        }
    }

    async fn start(local: &str) -> Self {
        Self::start_with(local, test_config(), MockMediaSource::default()).await
    }

    async fn start_with(local: &str, config: MeshConfig, media: MockMediaSource) -> Self {
        let mut harness = Self::new(local, config, media);
        harness
            .orchestrator
            .start_session(harness.session.clone(), local.into(), harness.media.clone())
            .await
            .unwrap();
        harness
    }

    fn join(&self, uid: &str) {
        self.relay.join(&self.session, &uid.into());
    }

    fn leave(&self, uid: &str) {
        self.relay.leave(&self.session, &uid.into());
    }

    async fn send(&self, from: &str, to: &str, payload: SignalPayload) {
        let message = SignalMessage::new(from.into(), to.into(), payload);
        self.relay.publish(&self.session, &message).await.unwrap();
    }

    fn stored(&self, kind: SignalKind, from: &str, to: &str) -> usize {
        signals(&self.relay.pending_signals(&self.session), kind, from, to).len()
    }
}

fn offer(sdp: &str) -> SignalPayload {
    SignalPayload::Offer(SessionDescription::offer(sdp))
}

fn answer(sdp: &str) -> SignalPayload {
    SignalPayload::Answer(SessionDescription::answer(sdp))
}

fn candidate(value: &str, mline: u16) -> SignalPayload {
    SignalPayload::Candidate(IceCandidateInit {
        candidate: value.into(),
        sdp_mid: Some(mline.to_string()),
        sdp_mline_index: Some(mline),
        username_fragment: None,
    })
}

#[tokio::test]
async fn test_scenario_a_new_peer_gets_one_offer() {
    let h = Harness::start("alice").await;
    wait_for_peers(&h.orchestrator, "first snapshot", |p| p.is_empty()).await;

    h.join("bob");

    let peers = wait_for_peers(&h.orchestrator, "offer to bob", |p| {
        p.len() == 1 && p[0].state == HandshakeState::OfferSent
    })
    .await;
    assert_eq!(peers[0].remote, ParticipantId::new("bob"));
    assert_eq!(peers[0].role, Role::Initiator);

    eventually("offer stored for bob", || {
        h.stored(SignalKind::Offer, "alice", "bob") == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.stored(SignalKind::Offer, "alice", "bob"), 1);
    assert_eq!(h.factory.created("bob"), 1);
}

#[tokio::test]
async fn test_scenario_b_inbound_offer_creates_responder() {
    let h = Harness::start("bob").await;

    h.send("alice", "bob", offer("v=0 from alice")).await;

    let peers = wait_for_peers(&h.orchestrator, "answer to alice", |p| {
        p.len() == 1 && p[0].state == HandshakeState::AnswerExchanged
    })
    .await;
    assert_eq!(peers[0].remote, ParticipantId::new("alice"));
    assert_eq!(peers[0].role, Role::Responder);

    eventually("answer stored and offer acked", || {
        h.stored(SignalKind::Answer, "bob", "alice") == 1
            && h.stored(SignalKind::Offer, "alice", "bob") == 0
    })
    .await;
}

#[tokio::test]
async fn test_scenario_c_departure_closes_and_notifies_once() {
    let h = Harness::start("alice").await;
    h.join("bob");
    wait_for_peers(&h.orchestrator, "bob entry", |p| p.len() == 1).await;

    h.leave("bob");

    wait_for_peers(&h.orchestrator, "bob removed", |p| p.is_empty()).await;
    assert_eq!(h.factory.closes("bob"), 1);
    assert_eq!(h.observer.removed("bob"), 1);

    let mut h = h;
    h.orchestrator.stop_session().await;
    assert_eq!(h.observer.removed("bob"), 1);
    assert_eq!(h.factory.closes("bob"), 1);
}

#[tokio::test]
async fn test_scenario_d_redelivered_candidates_are_harmless() {
    let h = Harness::start("bob").await;

    h.send("alice", "bob", offer("v=0 from alice")).await;
    h.send("alice", "bob", candidate("candidate:1", 0)).await;
    h.send("alice", "bob", candidate("candidate:2", 1)).await;
    // Copies seen again after a listener restart, newest first
    h.send("alice", "bob", candidate("candidate:2", 1)).await;
    h.send("alice", "bob", candidate("candidate:1", 0)).await;

    eventually("both candidates applied", || {
        h.factory.with_log("alice", |log| log.candidates.len()) == Some(2)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        h.factory.with_log("alice", |log| log.candidates.len()),
        Some(2)
    );
    let peers = h.orchestrator.peers().await;
    assert_eq!(peers[0].state, HandshakeState::AnswerExchanged);
    assert!(h.observer.events().iter().all(|e| !matches!(e, Observed::PeerFailed(_))));
}

#[tokio::test]
async fn test_responder_from_roster_waits_for_offer() {
    let h = Harness::start("bob").await;
    h.join("alice");

    let peers = wait_for_peers(&h.orchestrator, "alice entry", |p| {
        p.len() == 1 && p[0].state == HandshakeState::AwaitingOffer
    })
    .await;
    assert_eq!(peers[0].role, Role::Responder);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.relay.pending_signals(&h.session).is_empty());

    // The offer lands on the existing entry
    h.send("alice", "bob", offer("v=0 from alice")).await;
    let peers = wait_for_peers(&h.orchestrator, "answered", |p| {
        p.len() == 1 && p[0].state == HandshakeState::AnswerExchanged
    })
    .await;
    assert_eq!(peers[0].generation, 1);
    assert_eq!(h.factory.created("alice"), 1);
}

#[tokio::test]
async fn test_rapid_rejoin_keeps_one_entry() {
    let h = Harness::start("alice").await;
    wait_for_peers(&h.orchestrator, "first snapshot", |p| p.is_empty()).await;

    for _ in 0..3 {
        h.join("bob");
        h.leave("bob");
    }
    h.join("bob");

    let peers = wait_for_peers(&h.orchestrator, "bob settled", |p| {
        p.len() == 1 && p[0].state == HandshakeState::OfferSent
    })
    .await;
    assert_eq!(peers[0].remote, ParticipantId::new("bob"));

    // Entries closed before their worker ran never built a transport
    let created = h.factory.created("bob");
    assert!(created >= 1);
    eventually("replaced transports closed", || {
        h.factory.closes("bob") == created - 1
    })
    .await;
    assert_eq!(h.observer.removed("bob"), 3);
}

#[tokio::test]
async fn test_link_events_reach_observer() {
    let h = Harness::start("alice").await;
    h.join("bob");
    wait_for_peers(&h.orchestrator, "offer sent", |p| {
        p.len() == 1 && p[0].state == HandshakeState::OfferSent
    })
    .await;

    h.send("bob", "alice", answer("v=0 from bob")).await;
    wait_for_peers(&h.orchestrator, "answer applied", |p| {
        p[0].state == HandshakeState::AnswerExchanged
    })
    .await;

    h.factory
        .emit("bob", TransportEvent::Link(LinkState::Connected));
    h.factory
        .emit("bob", TransportEvent::RemoteTrack("audio".to_string()));
    h.factory
        .emit("bob", TransportEvent::RemoteTrack("video".to_string()));

    let peers = wait_for_peers(&h.orchestrator, "connected with tracks", |p| {
        p[0].state == HandshakeState::Connected && p[0].remote_tracks == 2
    })
    .await;
    assert_eq!(peers.len(), 1);
    assert_eq!(
        h.observer.events(),
        vec![
            Observed::StreamAdded("bob".into(), 1),
            Observed::StreamAdded("bob".into(), 2),
        ]
    );
}

#[tokio::test]
async fn test_transport_failure_removes_entry() {
    let h = Harness::start("alice").await;
    h.join("bob");
    wait_for_peers(&h.orchestrator, "bob entry", |p| p.len() == 1).await;

    h.factory.emit("bob", TransportEvent::Link(LinkState::Failed));

    wait_for_peers(&h.orchestrator, "bob removed", |p| p.is_empty()).await;
    assert_eq!(h.factory.closes("bob"), 1);
    assert_eq!(
        h.observer.events(),
        vec![
            Observed::StreamRemoved("bob".into()),
            Observed::PeerFailed("bob".into()),
        ]
    );
    // Not redialed by default
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.factory.created("bob"), 1);
}

#[tokio::test]
async fn test_exhausted_publish_retries_fail_the_peer() {
    let h = Harness::start("alice").await;
    wait_for_peers(&h.orchestrator, "first snapshot", |p| p.is_empty()).await;
    h.relay.fail_next_publishes(3);

    h.join("bob");

    eventually("bob failed", || {
        h.observer.events().contains(&Observed::PeerFailed("bob".into()))
    })
    .await;
    wait_for_peers(&h.orchestrator, "bob removed", |p| p.is_empty()).await;
    assert_eq!(h.stored(SignalKind::Offer, "alice", "bob"), 0);
}

#[tokio::test]
async fn test_failed_peer_is_redialed_when_enabled() {
    let config = MeshConfig {
        redial_failed_peers: true,
        ..test_config()
    };
    let h = Harness::start_with("alice", config, MockMediaSource::default()).await;
    wait_for_peers(&h.orchestrator, "first snapshot", |p| p.is_empty()).await;
    h.relay.fail_next_publishes(3);

    h.join("bob");

    let peers = wait_for_peers(&h.orchestrator, "fresh instance", |p| {
        p.len() == 1 && p[0].generation == 2 && p[0].state == HandshakeState::OfferSent
    })
    .await;
    assert_eq!(peers[0].role, Role::Initiator);
    assert_eq!(h.factory.created("bob"), 2);
    assert_eq!(h.factory.closes("bob"), 1);
    eventually("second offer stored", || {
        h.stored(SignalKind::Offer, "alice", "bob") == 1
    })
    .await;
}

#[tokio::test]
async fn test_late_answer_for_removed_peer_is_discarded() {
    let h = Harness::start("alice").await;
    h.join("bob");
    wait_for_peers(&h.orchestrator, "bob entry", |p| p.len() == 1).await;
    h.leave("bob");
    wait_for_peers(&h.orchestrator, "bob removed", |p| p.is_empty()).await;

    h.send("bob", "alice", answer("v=0 late")).await;

    eventually("late answer acked", || {
        h.stored(SignalKind::Answer, "bob", "alice") == 0
    })
    .await;
    assert!(h.orchestrator.peers().await.is_empty());
    assert_eq!(h.factory.created("bob"), 1);
}

#[tokio::test]
async fn test_offer_against_tie_break_is_discarded() {
    let h = Harness::start("alice").await;
    wait_for_peers(&h.orchestrator, "first snapshot", |p| p.is_empty()).await;

    // alice < bob, so bob must never offer
    h.send("bob", "alice", offer("v=0 glare")).await;

    eventually("offer acked", || h.stored(SignalKind::Offer, "bob", "alice") == 0).await;
    assert!(h.orchestrator.peers().await.is_empty());
}

#[tokio::test]
async fn test_reactive_entry_for_unregistered_peer_is_dropped_on_next_snapshot() {
    let h = Harness::start("bob").await;
    h.send("alice", "bob", offer("v=0 from alice")).await;
    wait_for_peers(&h.orchestrator, "reactive entry", |p| p.len() == 1).await;

    h.join("carol");

    let peers = wait_for_peers(&h.orchestrator, "alice dropped", |p| {
        p.len() == 1 && p[0].remote == ParticipantId::new("carol")
    })
    .await;
    assert_eq!(peers[0].role, Role::Initiator);
    assert_eq!(h.observer.removed("alice"), 1);
}

#[tokio::test]
async fn test_stale_roster_defers_new_peers_and_keeps_existing() {
    let h = Harness::start("bob").await;
    h.join("amy");
    wait_for_peers(&h.orchestrator, "amy entry", |p| p.len() == 1).await;

    h.relay.interrupt_registry();
    // Neither change is visible while the feed is down
    h.leave("amy");
    h.join("alice");
    h.send("alice", "bob", offer("v=0 from alice")).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let peers = h.orchestrator.peers().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].remote, ParticipantId::new("amy"));
    assert_eq!(h.stored(SignalKind::Offer, "alice", "bob"), 1);
    assert_eq!(h.factory.closes("amy"), 0);

    h.relay.restore_registry();

    let peers = wait_for_peers(&h.orchestrator, "alice answered", |p| {
        p.len() == 1 && p[0].state == HandshakeState::AnswerExchanged
    })
    .await;
    assert_eq!(peers[0].remote, ParticipantId::new("alice"));
    assert_eq!(h.factory.closes("amy"), 1);
    eventually("deferred offer acked", || {
        h.stored(SignalKind::Offer, "alice", "bob") == 0
    })
    .await;
}

#[tokio::test]
async fn test_leaving_live_video_tears_down_mesh_and_keeps_waiting() {
    let h = Harness::start("alice").await;
    h.join("bob");
    wait_for_peers(&h.orchestrator, "bob entry", |p| p.len() == 1).await;

    let finished = DebateState {
        status: DebateStatus::Finished,
        mode: DebateMode::Video,
    };
    h.relay.set_state(&h.session, finished);

    eventually("session ended", || {
        h.observer.events().contains(&Observed::SessionEnded(finished))
    })
    .await;
    assert!(h.orchestrator.is_running());
    assert!(h.orchestrator.peers().await.is_empty());
    assert_eq!(h.observer.removed("bob"), 1);
    assert_eq!(h.factory.closes("bob"), 1);
    assert_eq!(h.media.released(), 1);

    // Inbox is closed while the debate is not live
    h.send("bob", "alice", answer("v=0 after finish")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.stored(SignalKind::Answer, "bob", "alice"), 1);

    let mut h = h;
    h.orchestrator.stop_session().await;
    assert_eq!(h.media.released(), 1);
    assert_eq!(h.observer.removed("bob"), 1);
}

#[tokio::test]
async fn test_chat_mode_session_never_builds_mesh() {
    let h = Harness::new("alice", test_config(), MockMediaSource::default());
    let chat = DebateState {
        status: DebateStatus::Live,
        mode: DebateMode::Chat,
    };
    h.relay.set_state(&h.session, chat);
    h.join("bob");
    h.send("bob", "alice", offer("v=0 from bob")).await;

    let mut h = h;
    h.orchestrator
        .start_session(h.session.clone(), "alice".into(), h.media.clone())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.orchestrator.is_running());
    assert!(h.orchestrator.peers().await.is_empty());
    assert_eq!(h.media.acquired(), 0);
    assert_eq!(h.factory.created("bob"), 0);
    assert!(h.observer.events().is_empty());
    assert_eq!(h.stored(SignalKind::Offer, "bob", "alice"), 1);

    h.orchestrator.stop_session().await;
    assert_eq!(h.media.released(), 0);
}

#[tokio::test]
async fn test_lobby_session_builds_mesh_once_live() {
    let h = Harness::new("alice", test_config(), MockMediaSource::default());
    h.relay.set_state(&h.session, DebateState::default());
    h.join("bob");

    let mut h = h;
    h.orchestrator
        .start_session(h.session.clone(), "alice".into(), h.media.clone())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.orchestrator.is_running());
    assert_eq!(h.media.acquired(), 0);
    assert_eq!(h.factory.created("bob"), 0);
    assert_eq!(h.stored(SignalKind::Offer, "alice", "bob"), 0);
    assert!(h.observer.events().is_empty());

    h.relay.set_state(&h.session, DebateState::live_video());

    wait_for_peers(&h.orchestrator, "mesh built", |p| {
        p.len() == 1 && p[0].state == HandshakeState::OfferSent
    })
    .await;
    assert_eq!(h.media.acquired(), 1);
    assert_eq!(h.stored(SignalKind::Offer, "alice", "bob"), 1);
    assert_eq!(h.factory.with_log("bob", |log| log.with_media), Some(true));
}

#[tokio::test]
async fn test_mesh_is_rebuilt_when_video_resumes() {
    let h = Harness::start("alice").await;
    h.join("bob");
    wait_for_peers(&h.orchestrator, "first mesh", |p| p.len() == 1).await;

    let chat = DebateState {
        status: DebateStatus::Live,
        mode: DebateMode::Chat,
    };
    h.relay.set_state(&h.session, chat);
    eventually("mesh torn down", || {
        h.observer.events().contains(&Observed::SessionEnded(chat))
    })
    .await;
    assert_eq!(h.media.released(), 1);
    assert!(h.orchestrator.peers().await.is_empty());

    h.relay.set_state(&h.session, DebateState::live_video());
    wait_for_peers(&h.orchestrator, "second mesh", |p| p.len() == 1).await;
    assert_eq!(h.media.acquired(), 2);
    assert_eq!(h.factory.created("bob"), 2);
    assert_eq!(h.factory.closes("bob"), 1);
    assert!(h.orchestrator.is_running());
}

#[tokio::test]
async fn test_signals_stored_before_start_wait_for_the_roster() {
    let h = Harness::new("bob", test_config(), MockMediaSource::default());
    h.join("alice");
    h.send("alice", "bob", offer("v=0 early")).await;
    h.send("alice", "bob", candidate("candidate:early", 0)).await;
    h.relay.interrupt_registry();

    let mut h = h;
    h.orchestrator
        .start_session(h.session.clone(), "bob".into(), h.media.clone())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.orchestrator.peers().await.is_empty());
    assert_eq!(h.stored(SignalKind::Offer, "alice", "bob"), 1);
    assert_eq!(h.stored(SignalKind::Candidate, "alice", "bob"), 1);

    h.relay.restore_registry();

    let peers = wait_for_peers(&h.orchestrator, "early offer answered", |p| {
        p.len() == 1 && p[0].state == HandshakeState::AnswerExchanged
    })
    .await;
    assert_eq!(peers[0].role, Role::Responder);
    eventually("early candidate applied", || {
        h.factory.with_log("alice", |log| log.candidates.len()) == Some(1)
    })
    .await;
    eventually("early signals acked", || {
        h.relay
            .pending_signals(&h.session)
            .iter()
            .all(|doc| doc.draft.from.as_str() != "alice")
    })
    .await;
    assert_eq!(h.stored(SignalKind::Answer, "bob", "alice"), 1);
}

#[tokio::test]
async fn test_offer_and_candidate_deferred_while_roster_is_stale() {
    let h = Harness::start("bob").await;
    eventually("live", || h.media.acquired() == 1).await;

    h.relay.interrupt_registry();
    h.join("alice");
    h.send("alice", "bob", offer("v=0 during outage")).await;
    h.send("alice", "bob", candidate("candidate:outage", 0)).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.orchestrator.peers().await.is_empty());
    assert_eq!(h.factory.created("alice"), 0);
    assert_eq!(h.stored(SignalKind::Offer, "alice", "bob"), 1);
    assert_eq!(h.stored(SignalKind::Candidate, "alice", "bob"), 1);

    h.relay.restore_registry();

    wait_for_peers(&h.orchestrator, "deferred offer answered", |p| {
        p.len() == 1 && p[0].state == HandshakeState::AnswerExchanged
    })
    .await;
    eventually("deferred candidate applied", || {
        h.factory.with_log("alice", |log| log.candidates.len()) == Some(1)
    })
    .await;
    eventually("deferred signals acked", || {
        h.stored(SignalKind::Offer, "alice", "bob") == 0
            && h.stored(SignalKind::Candidate, "alice", "bob") == 0
    })
    .await;
}

#[tokio::test]
async fn test_media_denied_runs_receive_only() {
    let h = Harness::start_with("alice", test_config(), MockMediaSource::denying()).await;
    h.join("bob");

    wait_for_peers(&h.orchestrator, "offer sent", |p| {
        p.len() == 1 && p[0].state == HandshakeState::OfferSent
    })
    .await;
    assert_eq!(h.observer.events()[0], Observed::MediaError);
    assert_eq!(h.factory.with_log("bob", |log| log.with_media), Some(false));

    let mut h = h;
    h.orchestrator.stop_session().await;
    assert_eq!(h.media.released(), 0);
}

#[tokio::test]
async fn test_start_is_reentrant_and_stop_releases_everything() {
    let mut h = Harness::start("alice").await;
    h.orchestrator
        .start_session(h.session.clone(), "alice".into(), h.media.clone())
        .await
        .unwrap();

    h.join("bob");
    wait_for_peers(&h.orchestrator, "bob entry", |p| p.len() == 1).await;
    assert_eq!(h.media.acquired(), 1);
    assert_eq!(h.factory.with_log("bob", |log| log.with_media), Some(true));

    h.orchestrator.stop_session().await;
    assert!(!h.orchestrator.is_running());
    assert_eq!(h.media.released(), 1);
    assert_eq!(h.factory.closes("bob"), 1);
    assert_eq!(h.observer.removed("bob"), 1);

    // Inbox is closed: nothing consumes new signals
    h.send("bob", "alice", answer("v=0 after stop")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.stored(SignalKind::Answer, "bob", "alice"), 1);

    h.orchestrator.stop_session().await;
    assert_eq!(h.media.released(), 1);
}

#[tokio::test]
async fn test_session_can_restart_after_stop() {
    let mut h = Harness::start("alice").await;
    eventually("first activation", || h.media.acquired() == 1).await;
    h.orchestrator.stop_session().await;
    assert_eq!(h.media.released(), 1);

    h.join("bob");
    h.orchestrator
        .start_session(h.session.clone(), "alice".into(), h.media.clone())
        .await
        .unwrap();

    wait_for_peers(&h.orchestrator, "bob entry", |p| p.len() == 1).await;
    assert_eq!(h.media.acquired(), 2);
    assert_eq!(h.media.released(), 1);
}
