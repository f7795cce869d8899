mod sessions;

use crate::state::AppState;
use crate::ws;
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // Session routes
        .route("/api/sessions/{id}", get(sessions::get_session))
        .route("/api/sessions/{id}/participants", post(sessions::join))
        .route(
            "/api/sessions/{id}/participants/{uid}",
            delete(sessions::leave),
        )
        .route("/api/sessions/{id}/state", put(sessions::set_state))
        // WebSocket endpoint
        .route("/ws", get(ws::handler::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
