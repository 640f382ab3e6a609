use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;
use crate::error::{ApiError, bad_request};
use crate::ingest::IngestError;
use crate::models::put::PutBody;

/// Ingest a batch of data points. The whole batch succeeds or fails; the
/// response carries write stats either way.
pub async fn put(
    State(state): State<AppState>,
    Json(body): Json<PutBody>,
) -> Result<impl IntoResponse, ApiError> {
    let points = body.into_points();
    let stats = state
        .ingestor
        .write(&state.pool, points)
        .await
        .map_err(|e| match e {
            IngestError::Invalid(msg) => bad_request(msg),
            IngestError::Db(e) => ApiError::Internal(e.into()),
        })?;
    Ok(Json(stats))
}
