//! Standalone challenge endpoint.

use axum::{extract::State, Json};
use chrono::Utc;
use serde::Serialize;

use super::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct ChallengeResponse {
    question: String,
    token: String,
    expires_in_secs: i64,
}

/// GET /challenge - mint a fresh math question
pub async fn new_challenge(
    State(state): State<AppState>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let challenge = state.gate.new_challenge().await?;
    let expires_in_secs = (challenge.expires_at - Utc::now()).num_seconds().max(0);

    Ok(Json(ChallengeResponse {
        question: challenge.question,
        token: challenge.token,
        expires_in_secs,
    }))
}
