use crate::store::RelayStore;
use crate::ws::connections::ConnectionManager;
use serde::Deserialize;
use std::sync::Arc;

const CONFIG_FILE: &str = "debate-relay";
const ENV_PREFIX: &str = "DEBATE_RELAY";

/// Relay configuration, from an optional `debate-relay.toml` and
/// `DEBATE_RELAY__*` environment variables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8090".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<RelayStore>,
    pub connections: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: Arc::new(RelayStore::new()),
            connections: Arc::new(ConnectionManager::new()),
        }
    }
}
