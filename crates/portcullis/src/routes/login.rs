//! Login pipeline endpoints.
//!
//! A host calls `/login/precheck` before verifying credentials, then exactly
//! one of `/login/failure` or `/login/success` with the verification result.

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use portcullis_common::{BlockReason, GateDecision, LoginStatus};
use serde::{Deserialize, Serialize};

use super::{resolve_identity, ApiError, ClientAddr};
use crate::gate::LoginSubmission;
use crate::state::AppState;

const DEFAULT_FAILURE_MESSAGE: &str = "Invalid username or password.";

#[derive(Debug, Deserialize)]
pub struct PrecheckRequest {
    /// Caller address as seen by the host; falls back to this request's peer
    #[serde(default)]
    ip: Option<String>,
    #[serde(flatten)]
    submission: LoginSubmission,
}

#[derive(Serialize)]
pub struct DecisionResponse {
    #[serde(flatten)]
    decision: GateDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for DecisionResponse {
    fn into_response(self) -> Response {
        let status = match self.decision {
            GateDecision::Allow => StatusCode::OK,
            GateDecision::Blocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateDecision::ChallengeRequired | GateDecision::ChallengeFailed { .. } => {
                StatusCode::FORBIDDEN
            }
        };

        let retry_after = match self.decision {
            GateDecision::Blocked {
                retry_after_minutes,
                ..
            } => Some(HeaderValue::from(retry_after_minutes.saturating_mul(60))),
            _ => None,
        };

        let mut response = (status, Json(self)).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

/// POST /login/precheck
pub async fn precheck(
    State(state): State<AppState>,
    client: ClientAddr,
    Json(req): Json<PrecheckRequest>,
) -> Result<DecisionResponse, ApiError> {
    let identity = resolve_identity(&state, req.ip.as_deref(), &client)?;
    let decision = state.gate.precheck(&identity, &req.submission).await;

    Ok(DecisionResponse {
        message: decision.message(),
        decision,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct FailureRequest {
    #[serde(default)]
    ip: Option<String>,
    /// The host's own credential error, decorated with an attempts hint
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
pub struct FailureResponse {
    remaining_attempts: u32,
    locked: bool,
    message: String,
}

/// POST /login/failure
pub async fn failure(
    State(state): State<AppState>,
    client: ClientAddr,
    Json(req): Json<FailureRequest>,
) -> Result<Json<FailureResponse>, ApiError> {
    let identity = resolve_identity(&state, req.ip.as_deref(), &client)?;
    let max_attempts = state.gate.policy().max_attempts;
    let base = req
        .message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_FAILURE_MESSAGE);

    let Some(record) = state.gate.on_failure(&identity).await else {
        return Ok(Json(FailureResponse {
            remaining_attempts: max_attempts,
            locked: false,
            message: base.to_string(),
        }));
    };

    let now = Utc::now();
    if record.is_locked_at(now) {
        let blocked = GateDecision::Blocked {
            reason: BlockReason::Lockout,
            retry_after_minutes: record.remaining_lockout_minutes(now),
        };
        return Ok(Json(FailureResponse {
            remaining_attempts: 0,
            locked: true,
            message: blocked.message().unwrap_or_else(|| base.to_string()),
        }));
    }

    Ok(Json(FailureResponse {
        remaining_attempts: record.remaining_attempts(max_attempts),
        locked: false,
        message: state.gate.decorate_error(&identity, base).await,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct IdentityRequest {
    #[serde(default)]
    ip: Option<String>,
}

/// POST /login/success
pub async fn success(
    State(state): State<AppState>,
    client: ClientAddr,
    Json(req): Json<IdentityRequest>,
) -> Result<StatusCode, ApiError> {
    let identity = resolve_identity(&state, req.ip.as_deref(), &client)?;
    state.gate.on_success(&identity).await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /login/status?ip=
pub async fn status(
    State(state): State<AppState>,
    client: ClientAddr,
    Query(query): Query<IdentityRequest>,
) -> Result<Json<LoginStatus>, ApiError> {
    let identity = resolve_identity(&state, query.ip.as_deref(), &client)?;
    Ok(Json(state.gate.login_status(&identity).await))
}
