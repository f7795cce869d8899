use anyhow::{Context, Result};
use debate_mesh::error::MediaError;
use debate_mesh::media::SyntheticMediaSource;
use debate_mesh::relay::RemoteRelay;
use debate_mesh::transport::RtcTransportFactory;
use debate_mesh::{MeshConfig, SessionObserver, SessionOrchestrator};
use debate_protocol::{DebateState, DebateStatus, ParticipantId, SessionId};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webrtc::track::track_remote::TrackRemote;

/// Logs mesh events in place of a UI
struct LogObserver {
    ended: Arc<Notify>,
}

impl SessionObserver<Arc<TrackRemote>> for LogObserver {
    fn on_remote_stream_added(&self, remote: &ParticipantId, tracks: &[Arc<TrackRemote>]) {
        let kinds: Vec<String> = tracks.iter().map(|t| t.kind().to_string()).collect();
        tracing::info!("Receiving from {}: {}", remote, kinds.join(", "));
    }

    fn on_remote_stream_removed(&self, remote: &ParticipantId) {
        tracing::info!("Stream from {} removed", remote);
    }

    fn on_media_error(&self, error: &MediaError) {
        tracing::warn!("Local media unavailable, receiving only: {}", error);
    }

    fn on_session_ended(&self, state: &DebateState) {
        if state.status == DebateStatus::Finished {
            tracing::info!("Debate finished, leaving");
            self.ended.notify_one();
        } else {
            tracing::info!(
                "Debate is {:?}/{:?}, waiting for live video",
                state.status,
                state.mode
            );
        }
    }

    fn on_peer_failed(&self, remote: &ParticipantId, reason: &str) {
        tracing::warn!("Peer {} failed: {}", remote, reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debate_mesh=debug,debate_peer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = MeshConfig::load()?;
    let session_id = SessionId::new(
        std::env::var("DEBATE_SESSION").context("DEBATE_SESSION must name the debate to join")?,
    );
    let local_id = ParticipantId::new(
        std::env::var("DEBATE_PARTICIPANT").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string()),
    );

    tracing::info!("Starting debate peer {} for session {}", local_id, session_id);

    let relay = Arc::new(RemoteRelay::connect_with(&config.relay_url, config.retry).await?);
    relay.join(&session_id, &local_id).await?;

    let factory = RtcTransportFactory::new(&config.ice_servers())?;
    let ended = Arc::new(Notify::new());
    let observer = Arc::new(LogObserver {
        ended: ended.clone(),
    });

    let mut orchestrator =
        SessionOrchestrator::new(config, relay.clone(), relay.clone(), factory, observer);
    orchestrator
        .start_session(
            session_id.clone(),
            local_id.clone(),
            Arc::new(SyntheticMediaSource),
        )
        .await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted, shutting down");
        }
        _ = ended.notified() => {}
    }

    orchestrator.stop_session().await;
    if let Err(e) = relay.leave(&session_id, &local_id).await {
        tracing::warn!("Failed to leave session {}: {}", session_id, e);
    }
    relay.close();

    Ok(())
}
