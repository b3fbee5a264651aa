//! Code-version-aware result cache.
//!
//! The code version is part of every key, so a new deployment never sees
//! results memoized by an older build. Nothing is evicted on upgrade; old
//! keys are simply never looked up again and age out through the TTL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::hashing::hash_canonical_json;

/// Build the cache key for a task invocation.
///
/// Format: `{task}:{code_version}:{digest}` where the digest covers the
/// canonical JSON of `[task, code_version, args]`.
pub fn build_cache_key(task_name: &str, args: &Value, code_version: &str) -> String {
    let digest = hash_canonical_json(&json!([task_name, code_version, args]));
    format!("{}:{}:{}", task_name, code_version, &digest[..32])
}

/// Cache sizing and expiry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry lifetime in seconds; `None` keeps entries until evicted (default: 300)
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: Option<u64>,

    /// Maximum number of entries; 0 disables caching (default: 1000)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_ttl_seconds() -> Option<u64> {
    Some(300)
}
fn default_max_entries() -> usize {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted_at: Instant,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Cache counters for health reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub ttl_seconds: Option<u64>,
    pub max_entries: usize,
}

/// In-memory TTL cache of task results
#[derive(Debug, Default)]
pub struct ResultCache {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResultCache {
    /// Create an empty cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a live entry
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    /// Look up a live entry as of `now`, dropping it if expired
    pub fn get_at(&self, key: &str, now: Instant) -> Option<Value> {
        let mut entries = self.lock();

        let expired = entries.get(key).map(|entry| entry.is_expired(now));
        let hit = match expired {
            Some(true) => {
                entries.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(false) => entries.get(key).map(|entry| entry.value.clone()),
            None => None,
        };

        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Store a result
    pub fn insert(&self, key: String, value: Value) {
        self.insert_at(key, value, Instant::now());
    }

    /// Store a result as of `now`, evicting to stay within `max_entries`
    pub fn insert_at(&self, key: String, value: Value, now: Instant) {
        if self.config.max_entries == 0 {
            return;
        }

        let mut entries = self.lock();

        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            let mut evicted = (before - entries.len()) as u64;

            while entries.len() >= self.config.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        entries.remove(&k);
                        evicted += 1;
                    }
                    None => break,
                }
            }
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }

        let expires_at = self
            .config
            .ttl_seconds
            .map(|secs| now + Duration::from_secs(secs));
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                expires_at,
            },
        );
    }

    /// Drop a single entry; returns whether it existed
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            ttl_seconds: self.config.ttl_seconds,
            max_entries: self.config.max_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_changes_with_code_version() {
        let args = json!({"a": 1});
        assert_ne!(
            build_cache_key("t", &args, "v1"),
            build_cache_key("t", &args, "v2")
        );
    }

    #[test]
    fn test_key_ignores_key_order() {
        let ab: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let ba: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(
            build_cache_key("t", &ab, "v1"),
            build_cache_key("t", &ba, "v1")
        );
    }

    #[test]
    fn test_key_distinguishes_task_and_args() {
        let args = json!({"site": "a"});
        let base = build_cache_key("deploy-site", &args, "v1");
        assert_ne!(base, build_cache_key("build-site", &args, "v1"));
        assert_ne!(base, build_cache_key("deploy-site", &json!({"site": "b"}), "v1"));
        assert!(base.starts_with("deploy-site:v1:"));
    }

    #[test]
    fn test_key_unambiguous_with_separators() {
        let args = json!({});
        assert_ne!(
            build_cache_key("a:b", &args, "c"),
            build_cache_key("a", &args, "b:c")
        );
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = ResultCache::new(CacheConfig::default());
        assert!(cache.get("k").is_none());

        cache.insert("k".to_string(), json!("v"));
        assert_eq!(cache.get("k"), Some(json!("v")));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_entries_expire() {
        let cache = ResultCache::new(CacheConfig {
            ttl_seconds: Some(10),
            max_entries: 10,
        });
        let t0 = Instant::now();
        cache.insert_at("k".to_string(), json!(1), t0);

        assert!(cache.get_at("k", t0 + Duration::from_secs(9)).is_some());
        assert!(cache.get_at("k", t0 + Duration::from_secs(10)).is_none());
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let cache = ResultCache::new(CacheConfig {
            ttl_seconds: None,
            max_entries: 2,
        });
        let t0 = Instant::now();
        cache.insert_at("a".to_string(), json!(1), t0);
        cache.insert_at("b".to_string(), json!(2), t0 + Duration::from_millis(1));
        cache.insert_at("c".to_string(), json!(3), t0 + Duration::from_millis(2));

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache = ResultCache::new(CacheConfig {
            ttl_seconds: None,
            max_entries: 0,
        });
        cache.insert("k".to_string(), json!(1));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = ResultCache::new(CacheConfig::default());
        cache.insert("a".to_string(), json!(1));
        cache.insert("b".to_string(), json!(2));

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }
}
