//! HTTP route handlers for the Portcullis sidecar.

use axum::{
    Json, Router,
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use portcullis_common::{IdentityHash, PortcullisError};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;

use crate::gate::STORE_OUTAGE_RETRY_MINUTES;
use crate::identity::resolve_client_ip;
use crate::state::AppState;

mod admin;
mod captcha;
mod health;
mod login;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))

        // Login pipeline call sites
        .route("/login/precheck", post(login::precheck))
        .route("/login/failure", post(login::failure))
        .route("/login/success", post(login::success))
        .route("/login/status", get(login::status))

        // Standalone challenge
        .route("/challenge", get(captcha::new_challenge))

        // Admin endpoints (bind the sidecar to a private interface)
        .nest("/admin", admin_routes())

        .layer(TraceLayer::new_for_http())
        // Add shared state
        .with_state(state)
}

fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/records", get(admin::list_records))
        .route("/records/{identity_hash}", delete(admin::delete_record))
}

/// Caller address from proxy headers (when trusted) or the socket peer
pub struct ClientAddr(pub Option<String>);

impl FromRequestParts<AppState> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let remote = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Ok(Self(resolve_client_ip(
            &parts.headers,
            remote,
            state.config.trust_proxy_headers,
        )))
    }
}

/// Prefer the address the host passed explicitly, then the request's own
fn resolve_identity(
    state: &AppState,
    explicit_ip: Option<&str>,
    client: &ClientAddr,
) -> Result<IdentityHash, ApiError> {
    explicit_ip
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or(client.0.as_deref())
        .map(|ip| state.identity(ip))
        .ok_or_else(|| {
            ApiError(PortcullisError::InvalidInput(
                "client address could not be resolved".to_string(),
            ))
        })
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Typed error rendered as JSON with its mapped status code
pub struct ApiError(pub PortcullisError);

impl From<PortcullisError> for ApiError {
    fn from(err: PortcullisError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let mut response = (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response();
        if self.0.is_retryable() {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(STORE_OUTAGE_RETRY_MINUTES * 60),
            );
        }
        response
    }
}
