//! Record administration: list and manual unlock.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use portcullis_common::{AttemptRecord, IdentityHash};
use serde::Serialize;

use super::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct RecordView {
    #[serde(flatten)]
    record: AttemptRecord,
    /// Lock status computed at read time; expired locks read as unlocked
    locked: bool,
}

/// GET /admin/records
pub async fn list_records(
    State(state): State<AppState>,
) -> Result<Json<Vec<RecordView>>, ApiError> {
    let now = Utc::now();
    let records = state.gate.records().await?;

    Ok(Json(
        records
            .into_iter()
            .map(|record| RecordView {
                locked: record.is_locked_at(now),
                record,
            })
            .collect(),
    ))
}

/// DELETE /admin/records/{identity_hash}
pub async fn delete_record(
    State(state): State<AppState>,
    Path(identity_hash): Path<String>,
) -> Result<StatusCode, ApiError> {
    let identity = IdentityHash::from_digest(identity_hash);

    if state.gate.forget(&identity).await? {
        tracing::info!(identity = %identity, "Attempt record removed by admin");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}
