//! Debate relay library
//!
//! In-memory stand-in for the shared document store the mesh signals
//! through: per-session signaling collections, participant registries and
//! debate state, served over WebSocket with a small REST API.

pub mod api;
pub mod error;
pub mod state;
pub mod store;
pub mod ws;

use std::sync::Arc;

/// Create and configure the relay application
pub fn create_app(config: state::Config) -> (axum::Router, Arc<store::RelayStore>) {
    let app_state = state::AppState::new(config);
    let store = app_state.store.clone();
    let router = api::create_router(app_state);
    (router, store)
}
