use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::{ApiError, bad_request};

#[derive(Debug, Deserialize)]
pub struct SuggestParams {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub q: String,
    #[serde(default = "default_max")]
    pub max: usize,
}

fn default_max() -> usize {
    25
}

/// `/api/suggest?type=metrics|tagk|tagv&q=&max=`, answered entirely from
/// the tagset cache.
pub async fn suggest(
    State(state): State<AppState>,
    Query(params): Query<SuggestParams>,
) -> Result<impl IntoResponse, ApiError> {
    let values = match params.kind.as_str() {
        "metrics" => state.cache.metric_names(),
        "tagk" => state.cache.tag_keys(),
        "tagv" => state.cache.all_tag_values(),
        other => {
            return Err(bad_request(format!(
                "unknown suggest type '{other}'; expected metrics, tagk or tagv"
            )));
        }
    };
    Ok(Json(narrow(values, &params.q, params.max)))
}

/// Tag keys observed on one metric's series.
pub async fn suggest_tag_keys(
    State(state): State<AppState>,
    Path(metric): Path<String>,
) -> Json<Vec<String>> {
    Json(state.cache.tag_keys_for_metric(&metric))
}

/// Values observed under one tag key, across all metrics.
pub async fn suggest_tag_values(
    State(state): State<AppState>,
    Path(tag_key): Path<String>,
) -> Json<Vec<String>> {
    let mut values = state.cache.tag_values_for_key(&tag_key);
    values.sort();
    Json(values)
}

fn narrow(mut values: Vec<String>, prefix: &str, max: usize) -> Vec<String> {
    if !prefix.is_empty() {
        values.retain(|v| v.starts_with(prefix));
    }
    values.sort();
    values.truncate(max);
    values
}
