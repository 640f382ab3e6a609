use dashmap::{DashMap, DashSet};
use std::collections::HashSet;

use crate::filters::TagPredicate;
use crate::models::{Tags, TagsetId};

/// Inverted index over tags: tag key → tag value → tagset ids, plus the flat
/// universe of tag values used by value suggestion with no key argument.
///
/// Written only under the tagset cache's refresh lock; read lock-free from
/// the query path. Readers may observe an in-flight refresh partially
/// applied, but every `(key, value, id)` triple appears atomically.
#[derive(Default)]
pub struct TagIndex {
    keys: DashMap<String, DashMap<String, DashSet<TagsetId>>>,
    all_values: DashSet<String>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tag(&self, key: &str, value: &str, id: TagsetId) {
        self.keys
            .entry(key.to_string())
            .or_default()
            .entry(value.to_string())
            .or_default()
            .insert(id);
        self.all_values.insert(value.to_string());
    }

    /// Remove one tagset's entries. With `prune_values`, values left without
    /// any referencing key are also dropped from the flat universe; bulk
    /// removals pass `false` and call `rebuild_tag_values` once at the end.
    pub fn remove_tagset(&self, id: TagsetId, tags: &Tags, prune_values: bool) {
        for (key, value) in tags {
            let mut value_emptied = false;
            if let Some(values) = self.keys.get(key) {
                match values.get(value) {
                    Some(ids) => {
                        ids.remove(&id);
                        value_emptied = ids.is_empty();
                    }
                    None => {}
                }
                if value_emptied {
                    values.remove_if(value, |_, ids| ids.is_empty());
                }
            }
            self.keys.remove_if(key, |_, values| values.is_empty());
            if value_emptied && prune_values && !self.value_under_any_key(value) {
                self.all_values.remove(value);
            }
        }
    }

    /// Recompute the flat value universe from the key index. O(total pairs).
    pub fn rebuild_tag_values(&self) {
        self.all_values.clear();
        for values in self.keys.iter() {
            for entry in values.value().iter() {
                self.all_values.insert(entry.key().clone());
            }
        }
    }

    fn value_under_any_key(&self, value: &str) -> bool {
        self.keys.iter().any(|values| values.contains_key(value))
    }

    /// Number of distinct values indexed under `key`; the filter-ordering
    /// selectivity heuristic.
    pub fn possible_tag_value_count(&self, key: &str) -> usize {
        self.keys.get(key).map(|values| values.len()).unwrap_or(0)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Union of tagset ids under `key` whose value satisfies the predicate.
    /// `None` when the key is not indexed at all.
    pub fn collect_matching(
        &self,
        key: &str,
        predicate: &TagPredicate,
    ) -> Option<HashSet<TagsetId>> {
        let values = self.keys.get(key)?;
        let mut out = HashSet::new();
        for entry in values.iter() {
            if predicate.matches(entry.key()) {
                for id in entry.value().iter() {
                    out.insert(*id);
                }
            }
        }
        Some(out)
    }

    pub fn tag_keys(&self) -> Vec<String> {
        self.keys.iter().map(|e| e.key().clone()).collect()
    }

    pub fn all_tag_values(&self) -> Vec<String> {
        self.all_values.iter().map(|v| v.clone()).collect()
    }

    pub fn values_for_key(&self, key: &str) -> Vec<String> {
        self.keys
            .get(key)
            .map(|values| values.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.all_values.is_empty()
    }
}
