use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::store::SessionSnapshot;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use debate_protocol::{DebateState, ParticipantDocument, ParticipantId, SessionId};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub uid: ParticipantId,
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>> {
    let snapshot = state
        .store
        .snapshot(&SessionId::new(id.clone()))
        .await
        .ok_or_else(|| AppError::NotFound(format!("Session {}", id)))?;
    Ok(Json(snapshot))
}

pub async fn join(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<JoinRequest>,
) -> Result<(StatusCode, Json<ParticipantDocument>)> {
    let participant = state.store.join(&SessionId::new(id), input.uid).await?;
    Ok((StatusCode::CREATED, Json(participant)))
}

pub async fn leave(
    State(state): State<AppState>,
    Path((id, uid)): Path<(String, String)>,
) -> Result<StatusCode> {
    if state
        .store
        .leave(&SessionId::new(id.clone()), &ParticipantId::new(uid.clone()))
        .await
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Participant {} in {}", uid, id)))
    }
}

pub async fn set_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<DebateState>,
) -> Result<Json<DebateState>> {
    state.store.set_state(&SessionId::new(id), input).await;
    Ok(Json(input))
}
