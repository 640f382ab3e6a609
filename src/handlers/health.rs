use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::AppState;

/// Liveness plus cache freshness: the tagset cache must have refreshed
/// within twice its update interval.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let threshold = chrono::Duration::from_std(state.config.tagset_cache_update_interval * 2)
        .unwrap_or(chrono::Duration::MAX);
    match state.cache.last_update_age() {
        Some(age) if age <= threshold => (StatusCode::OK, "ok"),
        Some(_) => (StatusCode::SERVICE_UNAVAILABLE, "tagset cache is stale"),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "tagset cache has never refreshed",
        ),
    }
}
