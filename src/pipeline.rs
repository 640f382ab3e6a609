use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::AppState;
use crate::aggregators::{Aggregator, AggregatorKind};
use crate::cache::TagsetCache;
use crate::downsample::{Downsample, FillPolicy};
use crate::error::{ApiError, bad_request};
use crate::filters::TagFilter;
use crate::models::query::{DpsValue, QueryDto, QueryResultDto};
use crate::models::{Tags, TagsetId};
use crate::rate::{RateConverter, RateOptions};

const RAW_SERIES_QUERY: &str = "SELECT tagset_id, time, value FROM point \
     WHERE metric_id = $1 AND tagset_id = ANY($2) AND time >= $3 AND time <= $4 \
     ORDER BY tagset_id, time";

/// A validated subquery, ready to execute.
struct PlannedPart {
    metric: String,
    filters: Vec<TagFilter>,
    aggregator: Option<AggregatorKind>,
    downsample: Option<Downsample>,
    rate: Option<RateOptions>,
    explicit_tags: bool,
}

/// Validate the whole request up front so every 400 happens before the
/// response stream starts.
fn plan_query(
    dto: &QueryDto,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>, Vec<PlannedPart>), ApiError> {
    let start = dto.start.resolve(now).map_err(bad_request)?;
    let end = match &dto.end {
        Some(spec) => spec.resolve(now).map_err(bad_request)?,
        None => now,
    };
    if end <= start {
        return Err(bad_request("query end must be after start"));
    }
    if dto.queries.is_empty() {
        return Err(bad_request("query must contain at least one subquery"));
    }

    let mut parts = Vec::with_capacity(dto.queries.len());
    for q in &dto.queries {
        if q.metric.is_empty() {
            return Err(bad_request("subquery with empty metric"));
        }
        let aggregator = match q.aggregator.as_deref() {
            None | Some("none") => None,
            Some(name) => Some(name.parse::<AggregatorKind>().map_err(bad_request)?),
        };
        let downsample = q
            .downsample
            .as_deref()
            .map(str::parse::<Downsample>)
            .transpose()
            .map_err(bad_request)?;
        parts.push(PlannedPart {
            metric: q.metric.clone(),
            filters: q.build_filters().map_err(bad_request)?,
            aggregator,
            downsample,
            rate: q.rate.then(|| q.rate_options.unwrap_or_default()),
            explicit_tags: q.explicit_tags,
        });
    }
    Ok((start, end, parts))
}

/// Execute `/api/query`, emitting one series at a time through a bounded
/// channel. The receiver backpressures the pipeline through the HTTP writer;
/// a disconnected client fails the next send and unwinds the task.
pub fn run_query(
    state: &AppState,
    dto: QueryDto,
) -> Result<ReceiverStream<anyhow::Result<QueryResultDto>>, ApiError> {
    let (start, end, parts) = plan_query(&dto, Utc::now())?;
    let (tx, rx) = mpsc::channel(8);
    let pool = state.pool.clone();
    let cache = state.cache.clone();
    tokio::spawn(async move {
        for part in parts {
            match execute_part(&pool, &cache, &part, start, end, &tx).await {
                Ok(true) => {}
                Ok(false) => return, // client went away
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });
    Ok(ReceiverStream::new(rx))
}

async fn execute_part(
    pool: &PgPool,
    cache: &TagsetCache,
    part: &PlannedPart,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tx: &mpsc::Sender<anyhow::Result<QueryResultDto>>,
) -> anyhow::Result<bool> {
    let metrics = [part.metric.clone()];
    let tagsets = cache.get_tagsets(&metrics, &part.filters, part.explicit_tags);
    if tagsets.is_empty() {
        return Ok(true);
    }
    let Some(metric_id) = cache.metric_id(&part.metric) else {
        return Ok(true);
    };
    let ids: Vec<TagsetId> = tagsets.keys().copied().collect();

    // widen so the first in-range rate sample has a predecessor
    let scan_start = if part.rate.is_some() {
        start - chrono::Duration::hours(1)
    } else {
        start
    };

    match part.aggregator {
        Some(kind) => {
            emit_aggregated(
                pool, part, kind, &tagsets, metric_id, &ids, scan_start, start, end, tx,
            )
            .await
        }
        None => emit_raw(pool, part, &tagsets, metric_id, &ids, scan_start, start, end, tx).await,
    }
}

struct GroupSeed {
    /// Tags shared (key and value) by every member tagset.
    tags: Tags,
    /// Keys present in some member but aggregated away.
    aggregate_tags: Vec<String>,
}

struct GroupPlan {
    group_of: HashMap<TagsetId, usize>,
    seeds: Vec<GroupSeed>,
    /// Seed indices in group-key order, for deterministic emission.
    order: Vec<usize>,
}

/// Map each candidate tagset to its group: the tuple of values at the
/// grouping keys.
fn build_groups(tagsets: &HashMap<TagsetId, Arc<Tags>>, group_keys: &[String]) -> GroupPlan {
    let mut index: BTreeMap<Vec<Option<String>>, usize> = BTreeMap::new();
    let mut group_of = HashMap::with_capacity(tagsets.len());
    let mut members: Vec<(Tags, BTreeSet<String>)> = Vec::new();

    // BTreeMap iteration keeps group assembly independent of hash order
    let ordered: BTreeMap<TagsetId, &Arc<Tags>> =
        tagsets.iter().map(|(id, tags)| (*id, tags)).collect();
    for (id, tags) in ordered {
        let key: Vec<Option<String>> = group_keys.iter().map(|k| tags.get(k).cloned()).collect();
        let next = members.len();
        let slot = *index.entry(key).or_insert(next);
        if slot == members.len() {
            members.push(((**tags).clone(), tags.keys().cloned().collect()));
        } else {
            let (shared, all_keys) = &mut members[slot];
            shared.retain(|k, v| tags.get(k) == Some(&*v));
            all_keys.extend(tags.keys().cloned());
        }
        group_of.insert(id, slot);
    }

    let order: Vec<usize> = index.into_values().collect();
    let seeds = members
        .into_iter()
        .map(|(tags, all_keys)| {
            let aggregate_tags: Vec<String> = all_keys
                .into_iter()
                .filter(|k| !tags.contains_key(k))
                .collect();
            GroupSeed {
                tags,
                aggregate_tags,
            }
        })
        .collect();
    GroupPlan {
        group_of,
        seeds,
        order,
    }
}

#[allow(clippy::too_many_arguments)]
async fn emit_aggregated(
    pool: &PgPool,
    part: &PlannedPart,
    kind: AggregatorKind,
    tagsets: &HashMap<TagsetId, Arc<Tags>>,
    metric_id: crate::models::MetricId,
    ids: &[TagsetId],
    scan_start: DateTime<Utc>,
    query_start: DateTime<Utc>,
    end: DateTime<Utc>,
    tx: &mpsc::Sender<anyhow::Result<QueryResultDto>>,
) -> anyhow::Result<bool> {
    let group_keys: Vec<String> = part
        .filters
        .iter()
        .filter(|f| f.group_by)
        .map(|f| f.key.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let plan = build_groups(tagsets, &group_keys);
    let mut buckets: Vec<BTreeMap<i64, Aggregator>> =
        (0..plan.seeds.len()).map(|_| BTreeMap::new()).collect();

    match &part.downsample {
        Some(ds) => {
            let q = ds.build_query(scan_start, end);
            let mut query = sqlx::query(&q.sql)
                .bind(metric_id)
                .bind(ids)
                .bind(q.start)
                .bind(q.end);
            if let Some(interval) = q.interval {
                query = query.bind(interval);
            }
            let mut rows = query.fetch(pool);
            while let Some(row) = rows.try_next().await? {
                let tagset_id: TagsetId = row.get("tagset_id");
                let bucket: Option<DateTime<Utc>> = row.get("bucket");
                let value: Option<f64> = row.get("value");
                let label = ds.bucket_label_secs(bucket, query_start);
                if let Some(&slot) = plan.group_of.get(&tagset_id) {
                    buckets[slot]
                        .entry(label)
                        .or_insert_with(|| Aggregator::new(kind))
                        .add(value);
                }
            }
        }
        None => {
            // no downsample: the whole window folds into one bucket stamped
            // with the query start
            let label = query_start.timestamp();
            let mut rows = sqlx::query(RAW_SERIES_QUERY)
                .bind(metric_id)
                .bind(ids)
                .bind(scan_start)
                .bind(end)
                .fetch(pool);
            while let Some(row) = rows.try_next().await? {
                let tagset_id: TagsetId = row.get("tagset_id");
                let value: f64 = row.get("value");
                if let Some(&slot) = plan.group_of.get(&tagset_id) {
                    buckets[slot]
                        .entry(label)
                        .or_insert_with(|| Aggregator::new(kind))
                        .add(Some(value));
                }
            }
        }
    }

    let fill = part
        .downsample
        .as_ref()
        .map(|ds| ds.fill)
        .unwrap_or_default();
    for slot in plan.order {
        let seed = &plan.seeds[slot];
        let folded = std::mem::take(&mut buckets[slot]);
        let dps = finish_series(folded, part.rate, query_start, fill);
        let result = QueryResultDto {
            metric: part.metric.clone(),
            tags: seed.tags.clone(),
            aggregate_tags: seed.aggregate_tags.clone(),
            dps,
        };
        if tx.send(Ok(result)).await.is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
async fn emit_raw(
    pool: &PgPool,
    part: &PlannedPart,
    tagsets: &HashMap<TagsetId, Arc<Tags>>,
    metric_id: crate::models::MetricId,
    ids: &[TagsetId],
    scan_start: DateTime<Utc>,
    query_start: DateTime<Utc>,
    end: DateTime<Utc>,
    tx: &mpsc::Sender<anyhow::Result<QueryResultDto>>,
) -> anyhow::Result<bool> {
    let fill = part
        .downsample
        .as_ref()
        .map(|ds| ds.fill)
        .unwrap_or_default();
    let mut current: Option<(TagsetId, BTreeMap<i64, Aggregator>)> = None;

    macro_rules! flush {
        () => {
            if let Some((id, folded)) = current.take() {
                let tags = tagsets.get(&id).map(|t| (**t).clone()).unwrap_or_default();
                let dps = finish_series(folded, part.rate, query_start, fill);
                let result = QueryResultDto {
                    metric: part.metric.clone(),
                    tags,
                    aggregate_tags: Vec::new(),
                    dps,
                };
                if tx.send(Ok(result)).await.is_err() {
                    return Ok(false);
                }
            }
        };
    }

    match &part.downsample {
        Some(ds) => {
            let q = ds.build_query(scan_start, end);
            let mut query = sqlx::query(&q.sql)
                .bind(metric_id)
                .bind(ids)
                .bind(q.start)
                .bind(q.end);
            if let Some(interval) = q.interval {
                query = query.bind(interval);
            }
            let mut rows = query.fetch(pool);
            while let Some(row) = rows.try_next().await? {
                let tagset_id: TagsetId = row.get("tagset_id");
                let bucket: Option<DateTime<Utc>> = row.get("bucket");
                let value: Option<f64> = row.get("value");
                let label = ds.bucket_label_secs(bucket, query_start);
                if current.as_ref().map(|(id, _)| *id) != Some(tagset_id) {
                    flush!();
                    current = Some((tagset_id, BTreeMap::new()));
                }
                // a pass-through cell per bucket; a gap row leaves the fold
                // empty so the fill policy can see it
                let (_, folded) = current.as_mut().expect("segment open");
                folded
                    .entry(label)
                    .or_insert_with(|| Aggregator::new(AggregatorKind::Last))
                    .add(value);
            }
            flush!();
        }
        None => {
            let mut rows = sqlx::query(RAW_SERIES_QUERY)
                .bind(metric_id)
                .bind(ids)
                .bind(scan_start)
                .bind(end)
                .fetch(pool);
            while let Some(row) = rows.try_next().await? {
                let tagset_id: TagsetId = row.get("tagset_id");
                let time: DateTime<Utc> = row.get("time");
                let value: f64 = row.get("value");
                if current.as_ref().map(|(id, _)| *id) != Some(tagset_id) {
                    flush!();
                    current = Some((tagset_id, BTreeMap::new()));
                }
                let (_, folded) = current.as_mut().expect("segment open");
                folded
                    .entry(time.timestamp())
                    .or_insert_with(|| Aggregator::new(AggregatorKind::Last))
                    .add(Some(value));
            }
            flush!();
        }
    }
    Ok(true)
}

/// Turn a series' folded buckets into emitted datapoints: optional rate
/// conversion over the time-ordered buckets, then fill-policy mapping for
/// gap buckets.
fn finish_series(
    buckets: BTreeMap<i64, Aggregator>,
    rate: Option<RateOptions>,
    query_start: DateTime<Utc>,
    fill: FillPolicy,
) -> BTreeMap<i64, DpsValue> {
    let mut dps = BTreeMap::new();
    let mut converter = rate.map(|o| RateConverter::new(o, query_start.timestamp() as f64));
    for (label, mut agg) in buckets {
        match (agg.result(), &mut converter) {
            (Some(v), Some(rc)) => {
                if let Some(r) = rc.try_calc(label as f64, v) {
                    dps.insert(label, DpsValue::Value(r));
                }
            }
            (Some(v), None) => {
                if label >= query_start.timestamp() {
                    dps.insert(label, DpsValue::Value(v));
                }
            }
            (None, _) => {
                // gap bucket: the widened rate scan also produces buckets
                // before the window, which are never emitted
                if label < query_start.timestamp() {
                    continue;
                }
                match fill {
                    FillPolicy::None => {}
                    FillPolicy::Zero => {
                        dps.insert(label, DpsValue::Value(0.0));
                    }
                    FillPolicy::Nan => {
                        dps.insert(label, DpsValue::Value(f64::NAN));
                    }
                    FillPolicy::Null => {
                        dps.insert(label, DpsValue::Null);
                    }
                }
            }
        }
    }
    dps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::time::TimeSpec;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn tagset_map(entries: &[(TagsetId, &[(&str, &str)])]) -> HashMap<TagsetId, Arc<Tags>> {
        entries
            .iter()
            .map(|(id, pairs)| (*id, Arc::new(tags(pairs))))
            .collect()
    }

    #[test]
    fn groups_split_on_grouping_key_values() {
        let tagsets = tagset_map(&[
            (1, &[("host", "a"), ("dc", "eu")]),
            (2, &[("host", "b"), ("dc", "eu")]),
        ]);
        let plan = build_groups(&tagsets, &["host".to_string()]);
        assert_eq!(plan.seeds.len(), 2);
        assert_eq!(plan.group_of[&1], 0);
        assert_eq!(plan.group_of[&2], 1);
        // each group keeps its full (single-member) tag set
        assert_eq!(plan.seeds[0].tags, tags(&[("host", "a"), ("dc", "eu")]));
        assert!(plan.seeds[0].aggregate_tags.is_empty());
    }

    #[test]
    fn group_tags_are_member_intersection() {
        let tagsets = tagset_map(&[
            (1, &[("host", "a"), ("dc", "eu")]),
            (2, &[("host", "b"), ("dc", "eu")]),
            (3, &[("host", "c"), ("dc", "eu"), ("rack", "r1")]),
        ]);
        let plan = build_groups(&tagsets, &[]);
        assert_eq!(plan.seeds.len(), 1);
        let seed = &plan.seeds[0];
        // host differs, rack is missing from two members; only dc survives
        assert_eq!(seed.tags, tags(&[("dc", "eu")]));
        let mut agg = seed.aggregate_tags.clone();
        agg.sort();
        assert_eq!(agg, vec!["host".to_string(), "rack".to_string()]);
    }

    #[test]
    fn grouped_members_share_grouping_values() {
        let tagsets = tagset_map(&[
            (1, &[("host", "a"), ("dc", "eu")]),
            (2, &[("host", "a"), ("dc", "us")]),
        ]);
        let plan = build_groups(&tagsets, &["host".to_string()]);
        assert_eq!(plan.seeds.len(), 1);
        // the grouping key survives the intersection by construction
        assert_eq!(plan.seeds[0].tags, tags(&[("host", "a")]));
    }

    #[test]
    fn finish_series_applies_fill_policies() {
        let start = Utc::now();
        let qs = start.timestamp();
        let folded = |entries: &[(i64, Option<f64>)]| -> BTreeMap<i64, Aggregator> {
            entries
                .iter()
                .map(|(label, v)| {
                    let mut agg = Aggregator::new(AggregatorKind::Sum);
                    agg.add(*v);
                    (qs + label, agg)
                })
                .collect()
        };

        let dps = finish_series(folded(&[(0, Some(1.0)), (60, None)]), None, start, FillPolicy::Zero);
        assert_eq!(dps[&qs], DpsValue::Value(1.0));
        assert_eq!(dps[&(qs + 60)], DpsValue::Value(0.0));

        let dps = finish_series(folded(&[(0, None)]), None, start, FillPolicy::Null);
        assert_eq!(dps[&qs], DpsValue::Null);

        let dps = finish_series(folded(&[(0, None)]), None, start, FillPolicy::None);
        assert!(dps.is_empty());

        let dps = finish_series(folded(&[(0, None)]), None, start, FillPolicy::Nan);
        assert!(matches!(dps[&qs], DpsValue::Value(v) if v.is_nan()));
    }

    #[test]
    fn finish_series_rates_over_ordered_buckets() {
        let start = Utc::now();
        let qs = start.timestamp();
        let mut buckets = BTreeMap::new();
        for (offset, v) in [(0i64, 10.0), (60, 40.0), (120, 100.0)] {
            let mut agg = Aggregator::new(AggregatorKind::Sum);
            agg.add(Some(v));
            buckets.insert(qs + offset, agg);
        }
        let dps = finish_series(
            buckets,
            Some(RateOptions::default()),
            start,
            FillPolicy::None,
        );
        assert_eq!(dps.len(), 2);
        assert_eq!(dps[&(qs + 60)], DpsValue::Value(0.5));
        assert_eq!(dps[&(qs + 120)], DpsValue::Value(1.0));
    }

    #[test]
    fn finish_series_drops_pre_window_buckets() {
        // buckets before the query start prime the rate converter but are
        // never emitted themselves
        let start = Utc::now();
        let qs = start.timestamp();
        let mut buckets = BTreeMap::new();
        for (offset, v) in [(-60i64, 5.0), (0, 10.0)] {
            let mut agg = Aggregator::new(AggregatorKind::Sum);
            agg.add(Some(v));
            buckets.insert(qs + offset, agg);
        }
        let dps = finish_series(buckets, None, start, FillPolicy::None);
        assert_eq!(dps.len(), 1);
        assert!(dps.contains_key(&qs));
    }

    #[test]
    fn plan_rejects_bad_requests() {
        let dto: QueryDto = serde_json::from_str(
            r#"{"start":"1h-ago","queries":[{"metric":"cpu","aggregator":"p95"}]}"#,
        )
        .unwrap();
        assert!(plan_query(&dto, Utc::now()).is_err());

        let dto: QueryDto = serde_json::from_str(r#"{"start":"1h-ago","queries":[]}"#).unwrap();
        assert!(plan_query(&dto, Utc::now()).is_err());

        let dto = QueryDto {
            start: TimeSpec::Text("now".into()),
            end: Some(TimeSpec::Text("1h-ago".into())),
            queries: vec![],
        };
        assert!(plan_query(&dto, Utc::now()).is_err());
    }

    #[test]
    fn plan_accepts_full_subquery() {
        let dto: QueryDto = serde_json::from_str(
            r#"{"start":"1h-ago","queries":[{
                "metric":"cpu","aggregator":"avg","rate":true,
                "rateOptions":{"counter":true,"counterMax":200},
                "downsample":"1m-sum-zero",
                "tags":{"host":"*"},
                "filters":[{"type":"literal_or","tagk":"dc","filter":"eu","groupBy":true}]
            }]}"#,
        )
        .unwrap();
        let (_, _, parts) = plan_query(&dto, Utc::now()).unwrap();
        assert_eq!(parts.len(), 1);
        let part = &parts[0];
        assert_eq!(part.aggregator, Some(AggregatorKind::Mean));
        assert!(part.rate.is_some());
        assert!(part.downsample.is_some());
        assert_eq!(part.filters.len(), 2);
    }
}
