use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use crate::cache::{TagsetKey, TtlLru};
use crate::config::Config;
use crate::models::put::{DataPoint, MissRates, PutStats};
use crate::models::time::epoch_to_utc;
use crate::models::{MetricId, Tags, TagsetId};

const METRIC_UPSERT: &str = "INSERT INTO metric (name) \
     SELECT * FROM unnest($1::text[]) AS t(name) \
     ON CONFLICT (name) DO UPDATE SET name = excluded.name \
     RETURNING id, name";

const TAGSET_UPSERT: &str = "INSERT INTO tagset (tags) \
     SELECT * FROM unnest($1::jsonb[]) AS t(tags) \
     ON CONFLICT (tags) DO UPDATE SET tags = excluded.tags \
     RETURNING id, tags";

// Sorted insert against the (metric_id, tagset_id, time) unique index keeps
// concurrent batches from deadlocking each other.
const POINT_INSERT: &str = "INSERT INTO point (metric_id, tagset_id, time, value) \
     SELECT * FROM unnest($1::smallint[], $2::int[], $3::timestamptz[], $4::float8[]) \
       AS t(metric_id, tagset_id, time, value) \
     ORDER BY metric_id, tagset_id, time \
     ON CONFLICT DO NOTHING";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug)]
struct Prepared {
    metric: String,
    key: TagsetKey,
    tags: Tags,
    time: DateTime<Utc>,
    value: f64,
}

/// Write path: resolves metric and tagset ids through bounded TTL caches,
/// upserting the misses, then bulk-inserts the batch. Any failure aborts the
/// whole batch and leaves the caches untouched.
pub struct Ingestor {
    metric_ids: TtlLru<String, MetricId>,
    tagset_ids: TtlLru<TagsetKey, TagsetId>,
}

impl Ingestor {
    pub fn new(config: &Config) -> Self {
        let ttl = config.cache_entry_ttl();
        Self {
            metric_ids: TtlLru::new(config.insert_metric_cache_size, ttl),
            tagset_ids: TtlLru::new(config.insert_tagset_cache_size, ttl),
        }
    }

    pub async fn write(&self, pool: &PgPool, points: Vec<DataPoint>) -> Result<PutStats, IngestError> {
        let started = Instant::now();
        let total = points.len();
        if total == 0 {
            return Ok(PutStats {
                points_written: 0,
                write_time_ms: 0,
                kdps: 0.0,
                miss_rates: MissRates {
                    metric: 0.0,
                    tagset: 0.0,
                },
            });
        }

        let (prepared, oldest) = prepare_batch(points)?;

        let mut metric_ids: HashMap<String, MetricId> = HashMap::new();
        let mut tagset_ids: HashMap<TagsetKey, TagsetId> = HashMap::new();
        let mut missing_metrics: BTreeSet<String> = BTreeSet::new();
        let mut missing_tagsets: BTreeMap<String, &Prepared> = BTreeMap::new();
        let mut metric_miss_points = 0usize;
        let mut tagset_miss_points = 0usize;

        for p in &prepared {
            if !metric_ids.contains_key(&p.metric) {
                match self.metric_ids.try_get(&p.metric) {
                    Some(id) => {
                        metric_ids.insert(p.metric.clone(), id);
                    }
                    None => {
                        missing_metrics.insert(p.metric.clone());
                    }
                }
            }
            if missing_metrics.contains(&p.metric) {
                metric_miss_points += 1;
            }
            if !tagset_ids.contains_key(&p.key) {
                match self.tagset_ids.try_get(&p.key) {
                    Some(id) => {
                        tagset_ids.insert(p.key.clone(), id);
                    }
                    None => {
                        missing_tagsets.insert(p.key.canonical_json().to_string(), p);
                    }
                }
            }
            if missing_tagsets.contains_key(p.key.canonical_json()) {
                tagset_miss_points += 1;
            }
        }

        if !missing_metrics.is_empty() {
            // BTreeSet iteration gives the ascending order the upsert relies on
            let names: Vec<String> = missing_metrics.into_iter().collect();
            let rows = sqlx::query(METRIC_UPSERT).bind(&names).fetch_all(pool).await?;
            for row in rows {
                metric_ids.insert(row.get("name"), row.get("id"));
            }
        }

        if !missing_tagsets.is_empty() {
            let docs: Vec<serde_json::Value> = missing_tagsets
                .values()
                .map(|p| serde_json::to_value(&p.tags).expect("tag map serializes"))
                .collect();
            let rows = sqlx::query(TAGSET_UPSERT).bind(&docs).fetch_all(pool).await?;
            for row in rows {
                let raw: serde_json::Value = row.get("tags");
                let tags: Tags = serde_json::from_value(raw).unwrap_or_default();
                tagset_ids.insert(TagsetKey::new(&tags), row.get("id"));
            }
        }

        let mut m = Vec::with_capacity(prepared.len());
        let mut t = Vec::with_capacity(prepared.len());
        let mut times = Vec::with_capacity(prepared.len());
        let mut values = Vec::with_capacity(prepared.len());
        for p in &prepared {
            let metric_id = metric_ids
                .get(&p.metric)
                .copied()
                .ok_or_else(|| IngestError::Invalid(format!("metric {} did not resolve", p.metric)))?;
            let tagset_id = tagset_ids
                .get(&p.key)
                .copied()
                .ok_or_else(|| IngestError::Invalid("tagset did not resolve".to_string()))?;
            m.push(metric_id);
            t.push(tagset_id);
            times.push(p.time);
            values.push(p.value);
        }

        let written = sqlx::query(POINT_INSERT)
            .bind(&m)
            .bind(&t)
            .bind(&times)
            .bind(&values)
            .execute(pool)
            .await?
            .rows_affected();

        // Only now, with the batch durable, revalidate every id used. The
        // batch's oldest timestamp is the newest instant every mapping is
        // provably valid at.
        for (name, id) in metric_ids {
            self.metric_ids.add_or_revalidate(name, id, oldest);
        }
        for (key, id) in tagset_ids {
            self.tagset_ids.add_or_revalidate(key, id, oldest);
        }

        let elapsed = started.elapsed();
        let secs = elapsed.as_secs_f64().max(1e-6);
        Ok(PutStats {
            points_written: written,
            write_time_ms: elapsed.as_millis() as u64,
            kdps: written as f64 / secs / 1000.0,
            miss_rates: MissRates {
                metric: metric_miss_points as f64 / total as f64,
                tagset: tagset_miss_points as f64 / total as f64,
            },
        })
    }
}

fn prepare_batch(points: Vec<DataPoint>) -> Result<(Vec<Prepared>, DateTime<Utc>), IngestError> {
    let mut prepared = Vec::with_capacity(points.len());
    let mut oldest: Option<DateTime<Utc>> = None;
    for p in points {
        if p.metric.is_empty() {
            return Err(IngestError::Invalid("data point with empty metric".to_string()));
        }
        let time = epoch_to_utc(p.timestamp).map_err(IngestError::Invalid)?;
        oldest = Some(oldest.map_or(time, |o| o.min(time)));
        prepared.push(Prepared {
            metric: p.metric,
            key: TagsetKey::new(&p.tags),
            tags: p.tags,
            time,
            value: p.value,
        });
    }
    let oldest = oldest.expect("non-empty batch");
    Ok((prepared, oldest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(metric: &str, timestamp: f64, tags: &[(&str, &str)]) -> DataPoint {
        DataPoint {
            metric: metric.to_string(),
            timestamp,
            value: 1.0,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn batch_tracks_oldest_timestamp() {
        let (prepared, oldest) = prepare_batch(vec![
            point("cpu", 1_700_000_100.0, &[("host", "a")]),
            point("cpu", 1_700_000_000.0, &[("host", "a")]),
            point("cpu", 1_700_000_200.0, &[("host", "b")]),
        ])
        .unwrap();
        assert_eq!(prepared.len(), 3);
        assert_eq!(oldest.timestamp(), 1_700_000_000);
    }

    #[test]
    fn millisecond_timestamps_are_recognized() {
        let (prepared, _) =
            prepare_batch(vec![point("cpu", 1_700_000_000_000.0, &[("host", "a")])]).unwrap();
        assert_eq!(prepared[0].time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn empty_metric_is_rejected() {
        let err = prepare_batch(vec![point("", 1_700_000_000.0, &[])]).unwrap_err();
        assert!(matches!(err, IngestError::Invalid(_)));
    }

    #[test]
    fn identical_tagsets_share_one_key() {
        let (prepared, _) = prepare_batch(vec![
            point("cpu", 1_700_000_000.0, &[("host", "a"), ("dc", "eu")]),
            point("mem", 1_700_000_010.0, &[("dc", "eu"), ("host", "a")]),
        ])
        .unwrap();
        assert_eq!(prepared[0].key, prepared[1].key);
    }

    #[test]
    fn insert_statements_carry_deadlock_ordering() {
        assert!(POINT_INSERT.contains("ORDER BY metric_id, tagset_id, time"));
        assert!(POINT_INSERT.contains("ON CONFLICT DO NOTHING"));
        // the spurious update is what forces RETURNING to cover existing rows
        assert!(METRIC_UPSERT.contains("DO UPDATE SET name = excluded.name"));
        assert!(TAGSET_UPSERT.contains("DO UPDATE SET tags = excluded.tags"));
    }
}
