use axum::{Json, extract::State, response::Response};
use chrono::{TimeZone, Utc};
use sqlx::Row;

use super::json_array_response;
use crate::AppState;
use crate::error::{ApiError, bad_request};
use crate::filters::{TagFilter, TagPredicate};
use crate::models::TagsetId;
use crate::models::query::{LastQueryDto, LastQueryResultDto, QueryDto};
use crate::pipeline;

/// Execute a query and stream the resulting series back as a JSON array.
pub async fn query(
    State(state): State<AppState>,
    Json(dto): Json<QueryDto>,
) -> Result<Response, ApiError> {
    let series = pipeline::run_query(&state, dto)?;
    Ok(json_array_response(series))
}

const LAST_POINT_QUERY: &str = "SELECT DISTINCT ON (tagset_id) tagset_id, time, value \
     FROM point \
     WHERE metric_id = $1 AND tagset_id = ANY($2) AND time >= $3 \
     ORDER BY tagset_id, time DESC";

/// Latest sample per matching series. Tags come from the tagset cache; a
/// tagset created since the last refresh is silently skipped rather than
/// erroring.
pub async fn query_last(
    State(state): State<AppState>,
    Json(dto): Json<LastQueryDto>,
) -> Result<Response, ApiError> {
    let cutoff = match dto.back_scan {
        Some(hours) if hours > 0 => Utc::now() - chrono::Duration::hours(hours),
        Some(_) => return Err(bad_request("backScan must be positive")),
        None => Utc.timestamp_micros(0).single().expect("epoch is valid"),
    };

    let mut results = Vec::new();
    for part in &dto.queries {
        let mut filters = Vec::with_capacity(part.tags.len());
        for (key, expr) in &part.tags {
            filters.push(TagFilter {
                key: key.clone(),
                predicate: TagPredicate::parse(expr).map_err(bad_request)?,
                group_by: false,
            });
        }

        let metrics = [part.metric.clone()];
        let tagsets = state.cache.get_tagsets(&metrics, &filters, false);
        if tagsets.is_empty() {
            continue;
        }
        let Some(metric_id) = state.cache.metric_id(&part.metric) else {
            continue;
        };
        let ids: Vec<TagsetId> = tagsets.keys().copied().collect();

        let rows = sqlx::query(LAST_POINT_QUERY)
            .bind(metric_id)
            .bind(&ids)
            .bind(cutoff)
            .fetch_all(&state.pool)
            .await?;
        for row in rows {
            let tagset_id: TagsetId = row.get("tagset_id");
            let Some(tags) = state.cache.tagset(tagset_id) else {
                continue;
            };
            let time: chrono::DateTime<Utc> = row.get("time");
            results.push(LastQueryResultDto {
                metric: part.metric.clone(),
                timestamp: time.timestamp_millis(),
                value: row.get("value"),
                tags: (*tags).clone(),
            });
        }
    }

    Ok(json_array_response(futures_util::stream::iter(
        results.into_iter().map(Ok),
    )))
}
