use chrono::{DateTime, TimeZone, Utc};
use dashmap::{DashMap, DashSet};
use futures_util::TryStreamExt;
use sqlx::{PgPool, Row};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use super::tag_index::TagIndex;
use crate::filters::TagFilter;
use crate::models::{MetricId, Tags, TagsetId};

/// In-memory image of every known tagset and its metric memberships, kept
/// current by incremental refresh against `tagset`/`time_series` high-water
/// marks. Readers are lock-free; refresh and prune serialize on one mutex.
///
/// Every tagset id reachable through the tag index or a per-metric membership
/// set is also a key of `tagset_by_id`: refresh admits the lookup entry
/// first and prune removes it last.
pub struct TagsetCache {
    tagset_by_id: DashMap<TagsetId, Arc<Tags>>,
    tagset_ids_by_metric: DashMap<String, DashSet<TagsetId>>,
    metric_ids_by_name: DashMap<String, MetricId>,
    tag_index: TagIndex,
    cursor: tokio::sync::Mutex<RefreshCursor>,
    /// Epoch microseconds of the last successful refresh; 0 = never.
    last_successful_update: AtomicI64,
}

#[derive(Default)]
struct RefreshCursor {
    tagset_hwm: Option<DateTime<Utc>>,
    time_series_hwm: Option<DateTime<Utc>>,
    refreshed_once: bool,
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_micros(0).single().expect("epoch is valid")
}

impl Default for TagsetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TagsetCache {
    pub fn new() -> Self {
        Self {
            tagset_by_id: DashMap::new(),
            tagset_ids_by_metric: DashMap::new(),
            metric_ids_by_name: DashMap::new(),
            tag_index: TagIndex::new(),
            cursor: tokio::sync::Mutex::new(RefreshCursor::default()),
            last_successful_update: AtomicI64::new(0),
        }
    }

    /// Incremental refresh: new tagsets first, then new series memberships.
    /// High-water marks advance row by row, so a cancelled cycle resumes
    /// cleanly on the next tick.
    pub async fn refresh(&self, pool: &PgPool) -> anyhow::Result<()> {
        let mut cursor = self.cursor.lock().await;

        let mut rows = sqlx::query(
            "SELECT id, tags, created FROM tagset WHERE created > $1 ORDER BY created",
        )
        .bind(cursor.tagset_hwm.unwrap_or_else(epoch))
        .fetch(pool);
        let mut admitted = 0usize;
        while let Some(row) = rows.try_next().await? {
            let id: TagsetId = row.get("id");
            let created: DateTime<Utc> = row.get("created");
            let raw: serde_json::Value = row.get("tags");
            self.admit_tagset(id, Arc::new(decode_tags(id, &raw)));
            cursor.tagset_hwm = Some(created);
            admitted += 1;
        }
        drop(rows);

        let mut rows = sqlx::query(
            "SELECT ts.tagset_id, ts.created, m.id AS metric_id, m.name AS metric_name \
             FROM time_series ts JOIN metric m ON m.id = ts.metric_id \
             WHERE ts.created > $1 ORDER BY ts.created",
        )
        .bind(cursor.time_series_hwm.unwrap_or_else(epoch))
        .fetch(pool);
        let mut linked = 0usize;
        while let Some(row) = rows.try_next().await? {
            let tagset_id: TagsetId = row.get("tagset_id");
            if !self.tagset_by_id.contains_key(&tagset_id) {
                // The tagset committed after our first pass; stop short of it
                // and pick the row up next cycle.
                tracing::debug!("tagset {tagset_id} not yet cached, deferring series refresh");
                break;
            }
            let created: DateTime<Utc> = row.get("created");
            let metric_id: MetricId = row.get("metric_id");
            let metric_name: String = row.get("metric_name");
            self.admit_series(&metric_name, metric_id, tagset_id);
            cursor.time_series_hwm = Some(created);
            linked += 1;
        }
        drop(rows);

        cursor.refreshed_once = true;
        self.last_successful_update
            .store(Utc::now().timestamp_micros(), Ordering::Relaxed);
        if admitted > 0 || linked > 0 {
            tracing::debug!("tagset cache refresh: {admitted} tagsets, {linked} series links");
        }
        Ok(())
    }

    /// Reconcile against the authoritative tagset id set, dropping entries
    /// housekeeping deleted. Runs only after at least one refresh.
    pub async fn prune(&self, pool: &PgPool) -> anyhow::Result<()> {
        let cursor = self.cursor.lock().await;
        if !cursor.refreshed_once {
            return Ok(());
        }

        let live: HashSet<TagsetId> = sqlx::query_scalar("SELECT id FROM tagset")
            .fetch_all(pool)
            .await?
            .into_iter()
            .collect();
        let dead: Vec<(TagsetId, Arc<Tags>)> = self
            .tagset_by_id
            .iter()
            .filter(|e| !live.contains(e.key()))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        if dead.is_empty() {
            return Ok(());
        }

        for (id, tags) in &dead {
            self.tag_index.remove_tagset(*id, tags, false);
            for members in self.tagset_ids_by_metric.iter() {
                members.value().remove(id);
            }
            self.tagset_by_id.remove(id);
        }
        self.tag_index.rebuild_tag_values();
        drop(cursor);
        tracing::info!("tagset cache prune: dropped {} stale tagsets", dead.len());
        Ok(())
    }

    fn admit_tagset(&self, id: TagsetId, tags: Arc<Tags>) {
        // lookup entry first: index entries must never dangle
        self.tagset_by_id.insert(id, tags.clone());
        for (k, v) in tags.iter() {
            self.tag_index.add_tag(k, v, id);
        }
    }

    fn admit_series(&self, metric_name: &str, metric_id: MetricId, tagset_id: TagsetId) {
        self.metric_ids_by_name
            .insert(metric_name.to_string(), metric_id);
        self.tagset_ids_by_metric
            .entry(metric_name.to_string())
            .or_default()
            .insert(tagset_id);
    }

    /// Resolve the candidate tagsets for a set of metrics under the given
    /// filters. Absent tag keys yield an empty result rather than an error.
    pub fn get_tagsets(
        &self,
        metrics: &[String],
        filters: &[TagFilter],
        explicit_tags: bool,
    ) -> HashMap<TagsetId, Arc<Tags>> {
        if filters.is_empty() && metrics.is_empty() {
            return self
                .tagset_by_id
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect();
        }

        let mut candidates: HashSet<TagsetId> = if metrics.is_empty() {
            self.tagset_by_id.iter().map(|e| *e.key()).collect()
        } else {
            let mut out = HashSet::new();
            for metric in metrics {
                if let Some(ids) = self.tagset_ids_by_metric.get(metric) {
                    for id in ids.iter() {
                        out.insert(*id);
                    }
                }
            }
            out
        };
        if candidates.is_empty() {
            return HashMap::new();
        }

        if explicit_tags {
            let filter_keys: BTreeSet<&str> = filters.iter().map(|f| f.key.as_str()).collect();
            candidates.retain(|id| {
                self.tagset_by_id.get(id).is_some_and(|tags| {
                    tags.len() == filter_keys.len()
                        && tags.keys().all(|k| filter_keys.contains(k.as_str()))
                })
            });
        }

        let mut ordered: Vec<&TagFilter> = filters.iter().collect();
        ordered.sort_by_key(|f| self.tag_index.possible_tag_value_count(&f.key));

        for filter in ordered {
            let value_count = self.tag_index.possible_tag_value_count(&filter.key);
            if value_count == 0 {
                return HashMap::new();
            }
            if !filter.predicate.is_literal_or() && value_count > candidates.len() {
                // backward: cheaper to test each candidate's own value
                candidates.retain(|id| {
                    self.tagset_by_id.get(id).is_some_and(|tags| {
                        tags.get(&filter.key)
                            .is_some_and(|v| filter.predicate.matches(v))
                    })
                });
            } else {
                let Some(matching) = self
                    .tag_index
                    .collect_matching(&filter.key, &filter.predicate)
                else {
                    return HashMap::new();
                };
                if matching.len() < candidates.len() {
                    candidates = matching
                        .into_iter()
                        .filter(|id| candidates.contains(id))
                        .collect();
                } else {
                    candidates.retain(|id| matching.contains(id));
                }
            }
            if candidates.is_empty() {
                return HashMap::new();
            }
        }

        candidates
            .into_iter()
            .filter_map(|id| self.tagset_by_id.get(&id).map(|tags| (id, tags.clone())))
            .collect()
    }

    pub fn metric_id(&self, name: &str) -> Option<MetricId> {
        self.metric_ids_by_name.get(name).map(|id| *id)
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.metric_ids_by_name
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn tagset(&self, id: TagsetId) -> Option<Arc<Tags>> {
        self.tagset_by_id.get(&id).map(|tags| tags.clone())
    }

    pub fn tag_keys(&self) -> Vec<String> {
        self.tag_index.tag_keys()
    }

    pub fn all_tag_values(&self) -> Vec<String> {
        self.tag_index.all_tag_values()
    }

    pub fn tag_values_for_key(&self, key: &str) -> Vec<String> {
        self.tag_index.values_for_key(key)
    }

    /// Distinct tag keys across a metric's cached tagsets.
    pub fn tag_keys_for_metric(&self, metric: &str) -> Vec<String> {
        let mut keys = BTreeSet::new();
        if let Some(ids) = self.tagset_ids_by_metric.get(metric) {
            for id in ids.iter() {
                if let Some(tags) = self.tagset_by_id.get(&id) {
                    keys.extend(tags.keys().cloned());
                }
            }
        }
        keys.into_iter().collect()
    }

    /// Age of the last successful refresh; `None` before the first one.
    pub fn last_update_age(&self) -> Option<chrono::Duration> {
        let stamp = self.last_successful_update.load(Ordering::Relaxed);
        if stamp == 0 {
            return None;
        }
        let at = Utc.timestamp_micros(stamp).single()?;
        Some(Utc::now() - at)
    }

    /// Test fixture hook: admit a tagset and its metric link without a DB.
    #[cfg(test)]
    pub(crate) fn admit_for_test(
        &self,
        metric: &str,
        metric_id: MetricId,
        tagset_id: TagsetId,
        tags: Tags,
    ) {
        self.admit_tagset(tagset_id, Arc::new(tags));
        self.admit_series(metric, metric_id, tagset_id);
    }
}

fn decode_tags(id: TagsetId, raw: &serde_json::Value) -> Tags {
    let mut tags = Tags::new();
    match raw.as_object() {
        Some(map) => {
            for (k, v) in map {
                match v.as_str() {
                    Some(s) => {
                        tags.insert(k.clone(), s.to_string());
                    }
                    None => tracing::warn!("tagset {id}: non-string value for tag {k}, skipped"),
                }
            }
        }
        None => tracing::warn!("tagset {id}: tags column is not a JSON object"),
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::TagPredicate;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn filter(key: &str, expr: &str) -> TagFilter {
        TagFilter {
            key: key.to_string(),
            predicate: TagPredicate::parse(expr).unwrap(),
            group_by: false,
        }
    }

    fn fixture() -> TagsetCache {
        let cache = TagsetCache::new();
        cache.admit_for_test("cpu", 1, 10, tags(&[("host", "web01"), ("dc", "eu")]));
        cache.admit_for_test("cpu", 1, 11, tags(&[("host", "web02"), ("dc", "eu")]));
        cache.admit_for_test("cpu", 1, 12, tags(&[("host", "db01"), ("dc", "us")]));
        cache.admit_for_test("mem", 2, 13, tags(&[("host", "web01")]));
        cache
    }

    #[test]
    fn filters_candidates_by_metric() {
        let cache = fixture();
        let result = cache.get_tagsets(&["mem".to_string()], &[], false);
        assert_eq!(result.keys().copied().collect::<Vec<_>>(), vec![13]);
        assert!(cache.get_tagsets(&["disk".to_string()], &[], false).is_empty());
    }

    #[test]
    fn no_filters_no_metrics_returns_everything() {
        let cache = fixture();
        assert_eq!(cache.get_tagsets(&[], &[], false).len(), 4);
    }

    #[test]
    fn literal_and_wildcard_filters_intersect() {
        let cache = fixture();
        let result = cache.get_tagsets(
            &["cpu".to_string()],
            &[filter("host", "web*"), filter("dc", "eu")],
            false,
        );
        let mut ids: Vec<_> = result.keys().copied().collect();
        ids.sort();
        assert_eq!(ids, vec![10, 11]);
    }

    #[test]
    fn absent_key_yields_empty_not_error() {
        let cache = fixture();
        let result = cache.get_tagsets(&["cpu".to_string()], &[filter("rack", "r1")], false);
        assert!(result.is_empty());
    }

    #[test]
    fn idempotent_on_unchanged_cache() {
        let cache = fixture();
        let metrics = ["cpu".to_string()];
        let filters = [filter("host", "web*")];
        let a = cache.get_tagsets(&metrics, &filters, false);
        let b = cache.get_tagsets(&metrics, &filters, false);
        assert_eq!(
            a.keys().collect::<HashSet<_>>(),
            b.keys().collect::<HashSet<_>>()
        );
    }

    #[test]
    fn explicit_tags_requires_exact_key_set() {
        let cache = fixture();
        // host-only filter: only tagset 13 has exactly {host}
        let result = cache.get_tagsets(&[], &[filter("host", "web01")], true);
        assert_eq!(result.keys().copied().collect::<Vec<_>>(), vec![13]);
        // host+dc: the eu/us cpu tagsets qualify, mem's host-only does not
        let result = cache.get_tagsets(
            &[],
            &[filter("host", "*"), filter("dc", "*")],
            true,
        );
        let mut ids: Vec<_> = result.keys().copied().collect();
        ids.sort();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[test]
    fn not_literal_or_excludes_matching_values() {
        let cache = fixture();
        let result = cache.get_tagsets(
            &["cpu".to_string()],
            &[filter("host", "not_literal_or(db01)")],
            false,
        );
        let mut ids: Vec<_> = result.keys().copied().collect();
        ids.sort();
        assert_eq!(ids, vec![10, 11]);
    }

    #[test]
    fn metric_ids_learned_from_series() {
        let cache = fixture();
        assert_eq!(cache.metric_id("cpu"), Some(1));
        assert_eq!(cache.metric_id("mem"), Some(2));
        assert_eq!(cache.metric_id("disk"), None);
    }

    #[test]
    fn suggest_surfaces_keys_and_values() {
        let cache = fixture();
        let mut keys = cache.tag_keys();
        keys.sort();
        assert_eq!(keys, vec!["dc".to_string(), "host".to_string()]);
        assert_eq!(
            cache.tag_keys_for_metric("mem"),
            vec!["host".to_string()]
        );
        let mut values = cache.tag_values_for_key("dc");
        values.sort();
        assert_eq!(values, vec!["eu".to_string(), "us".to_string()]);
    }
}
