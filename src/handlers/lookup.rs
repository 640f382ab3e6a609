use axum::{Json, extract::State, response::IntoResponse};
use std::collections::BTreeMap;

use crate::AppState;
use crate::error::{ApiError, bad_request};
use crate::filters::{TagFilter, TagPredicate};
use crate::models::query::{LookupRequestDto, LookupResponseDto, LookupResultDto};

/// Time-series lookup: every cached series matching a metric (or `*`) and a
/// set of tag predicates.
pub async fn lookup(
    State(state): State<AppState>,
    Json(dto): Json<LookupRequestDto>,
) -> Result<impl IntoResponse, ApiError> {
    let mut filters = Vec::with_capacity(dto.tags.len());
    for tag in &dto.tags {
        filters.push(TagFilter {
            key: tag.key.clone(),
            predicate: TagPredicate::parse(&tag.value).map_err(bad_request)?,
            group_by: false,
        });
    }

    let metrics: Vec<String> = if dto.metric == "*" || dto.metric.is_empty() {
        let mut names = state.cache.metric_names();
        names.sort();
        names
    } else {
        vec![dto.metric.clone()]
    };

    let mut all = Vec::new();
    for metric in metrics {
        let lookup_metrics = [metric.clone()];
        let tagsets = state.cache.get_tagsets(&lookup_metrics, &filters, false);
        let ordered: BTreeMap<_, _> = tagsets.into_iter().collect();
        for (_, tags) in ordered {
            all.push(LookupResultDto {
                metric: metric.clone(),
                tags: (*tags).clone(),
            });
        }
    }

    let total_results = all.len();
    let results: Vec<LookupResultDto> =
        all.into_iter().skip(dto.start_index).take(dto.limit).collect();
    Ok(Json(LookupResponseDto {
        kind: "LOOKUP",
        metric: dto.metric,
        total_results,
        results,
    }))
}
