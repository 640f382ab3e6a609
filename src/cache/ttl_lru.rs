use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::models::Tags;

/// Bounded LRU map with per-entry revalidation timestamps. A hit is only a
/// hit while `now - validated_at <= ttl`; stale entries are evicted on read.
///
/// Writers assert validity "as of" a caller-supplied instant; in the ingest
/// path that is the oldest timestamp of the batch just persisted, which is
/// the latest moment the id mapping was provably present in the database.
pub struct TtlLru<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    ttl: chrono::Duration,
}

struct Entry<V> {
    value: V,
    validated_at: DateTime<Utc>,
}

impl<K: Hash + Eq, V: Clone> TtlLru<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn try_get(&self, key: &K) -> Option<V> {
        self.try_get_at(key, Utc::now())
    }

    /// Explicit-clock variant for deterministic tests.
    pub fn try_get_at(&self, key: &K, now: DateTime<Utc>) -> Option<V> {
        let mut cache = self.inner.lock();
        let stale = match cache.get(key) {
            Some(entry) => {
                if now - entry.validated_at <= self.ttl {
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };
        if stale {
            cache.pop(key);
        }
        None
    }

    /// Insert or refresh. `validated_at` never regresses: both the existing
    /// stamp and `as_of` are instants at which the mapping was observed
    /// valid, so the later one wins.
    pub fn add_or_revalidate(&self, key: K, value: V, as_of: DateTime<Utc>) {
        let mut cache = self.inner.lock();
        if let Some(entry) = cache.get_mut(&key) {
            entry.value = value;
            if as_of > entry.validated_at {
                entry.validated_at = as_of;
            }
            return;
        }
        cache.put(
            key,
            Entry {
                value,
                validated_at: as_of,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// LRU key for a tagset: the canonical sorted-pair JSON plus a precomputed
/// hash. Equality is on content, never identity; hashing writes the cached
/// value so repeated probes don't re-walk the pairs.
#[derive(Debug, Clone)]
pub struct TagsetKey {
    canonical: String,
    hash: u64,
}

impl TagsetKey {
    pub fn new(tags: &Tags) -> Self {
        // BTreeMap iteration order makes the JSON canonical.
        let canonical = serde_json::to_string(tags).expect("tag map serializes");
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        canonical.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            canonical,
        }
    }

    /// The canonical JSON document, as stored in `tagset.tags`.
    pub fn canonical_json(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for TagsetKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.canonical == other.canonical
    }
}

impl Eq for TagsetKey {}

impl Hash for TagsetKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn hit_within_ttl_miss_after() {
        let cache: TtlLru<String, i32> = TtlLru::new(8, Duration::from_secs(60));
        cache.add_or_revalidate("cpu".into(), 7, t0());
        assert_eq!(
            cache.try_get_at(&"cpu".into(), t0() + chrono::Duration::seconds(59)),
            Some(7)
        );
        assert_eq!(
            cache.try_get_at(&"cpu".into(), t0() + chrono::Duration::seconds(61)),
            None
        );
        // the stale read evicted the entry
        assert!(cache.is_empty());
    }

    #[test]
    fn revalidation_extends_lifetime() {
        let cache: TtlLru<String, i32> = TtlLru::new(8, Duration::from_secs(60));
        cache.add_or_revalidate("cpu".into(), 7, t0());
        cache.add_or_revalidate("cpu".into(), 7, t0() + chrono::Duration::seconds(50));
        assert_eq!(
            cache.try_get_at(&"cpu".into(), t0() + chrono::Duration::seconds(100)),
            Some(7)
        );
    }

    #[test]
    fn validation_stamp_never_regresses() {
        let cache: TtlLru<String, i32> = TtlLru::new(8, Duration::from_secs(60));
        cache.add_or_revalidate("cpu".into(), 7, t0() + chrono::Duration::seconds(50));
        // a batch of old points must not shorten the entry's life
        cache.add_or_revalidate("cpu".into(), 7, t0());
        assert_eq!(
            cache.try_get_at(&"cpu".into(), t0() + chrono::Duration::seconds(100)),
            Some(7)
        );
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache: TtlLru<String, i32> = TtlLru::new(2, Duration::from_secs(3600));
        cache.add_or_revalidate("a".into(), 1, t0());
        cache.add_or_revalidate("b".into(), 2, t0());
        cache.try_get_at(&"a".into(), t0());
        cache.add_or_revalidate("c".into(), 3, t0());
        assert_eq!(cache.try_get_at(&"a".into(), t0()), Some(1));
        assert_eq!(cache.try_get_at(&"b".into(), t0()), None);
        assert_eq!(cache.try_get_at(&"c".into(), t0()), Some(3));
    }

    #[test]
    fn tagset_key_equality_is_content_based() {
        let mut a = Tags::new();
        a.insert("host".into(), "web01".into());
        a.insert("dc".into(), "eu".into());
        let mut b = Tags::new();
        b.insert("dc".into(), "eu".into());
        b.insert("host".into(), "web01".into());
        assert_eq!(TagsetKey::new(&a), TagsetKey::new(&b));
        assert_eq!(TagsetKey::new(&a).canonical_json(), TagsetKey::new(&b).canonical_json());

        let mut c = a.clone();
        c.insert("host".into(), "web02".into());
        assert_ne!(TagsetKey::new(&a), TagsetKey::new(&c));
    }
}
