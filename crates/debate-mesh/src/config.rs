//! Mesh configuration
//!
//! Loaded from an optional `debate-mesh.toml` next to the working directory,
//! overridden by `DEBATE_MESH__*` environment variables
//! (e.g. `DEBATE_MESH__RELAY_URL`, `DEBATE_MESH__RETRY__MAX_ATTEMPTS`).

use debate_protocol::IceServer;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

const CONFIG_FILE: &str = "debate-mesh";
const ENV_PREFIX: &str = "DEBATE_MESH";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// WebSocket URL of the relay service
    pub relay_url: String,
    /// STUN servers offered to every peer connection
    pub stun_servers: Vec<String>,
    /// TURN servers (optional)
    pub turn_servers: Vec<TurnServer>,
    /// Relay publish retry policy
    pub retry: RetryPolicy,
    /// Re-run the handshake with a fresh instance after a peer fails
    pub redial_failed_peers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Exponential backoff for transient relay failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubled each time and capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8090/ws".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
            retry: RetryPolicy::default(),
            redial_failed_peers: false,
        }
    }
}

impl MeshConfig {
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("stun_servers")
                    .try_parsing(true),
            )
            .build()?;

        let config: MeshConfig = settings.try_deserialize()?;
        tracing::debug!("Loaded mesh config: relay={}", config.relay_url);
        Ok(config)
    }

    /// ICE servers in protocol form
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let stun = self.stun_servers.iter().map(|url| IceServer {
            urls: vec![url.clone()],
            username: None,
            credential: None,
        });

        let turn = self.turn_servers.iter().map(|turn| IceServer {
            urls: vec![turn.url.clone()],
            username: Some(turn.username.clone()),
            credential: Some(turn.credential.clone()),
        });

        stun.chain(turn).collect()
    }
}
