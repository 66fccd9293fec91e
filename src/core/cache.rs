//! In-process TTL cache for the letter protection service.
//!
//! Entries expire lazily: an expired entry is deleted when it is next read and
//! reported as absent. When the store is full, the oldest inserted entry is
//! evicted (insertion order, not LRU). The cache is generic over its value so
//! the same component memoizes HTTP bodies and short-lived CAPTCHA answers.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::core::clock::{Clock, SystemClock};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid invalidation pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

struct CacheEntry<V> {
    value: V,
    created_at: DateTime<Utc>,
    ttl: Duration,
    hits: u64,
    /// Insertion sequence, the eviction order
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > self.ttl
    }
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
    hits: u64,
    misses: u64,
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }
}

/// Per-key hit count in [`CacheStats`]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KeyHits {
    pub key: String,
    pub hits: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, zero before the first lookup
    pub hit_rate: f64,
    pub top_keys: Vec<KeyHits>,
}

pub struct ResponseCache<V> {
    capacity: usize,
    default_ttl: Duration,
    state: Mutex<CacheState<V>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(capacity: usize, default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1),
            default_ttl,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                hits: 0,
                misses: 0,
            }),
            clock,
        }
    }

    pub fn with_system_clock(capacity: usize, default_ttl: Duration) -> Self {
        Self::new(capacity, default_ttl, Arc::new(SystemClock))
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a live entry, counting the hit or miss
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut state = self.lock();

        let expired = match state.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                state.misses += 1;
                metrics::increment_counter!("response_cache_lookups_total", "outcome" => "miss");
                return None;
            }
        };
        if expired {
            state.remove(key);
            state.misses += 1;
            metrics::increment_counter!("response_cache_lookups_total", "outcome" => "expired");
            return None;
        }

        state.hits += 1;
        metrics::increment_counter!("response_cache_lookups_total", "outcome" => "hit");
        let entry = state.entries.get_mut(key)?;
        entry.hits += 1;
        Some(entry.value.clone())
    }

    /// Store a value; `None` uses the default TTL.
    ///
    /// Replacing a key keeps its place in the eviction order.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let now = self.clock.now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut state = self.lock();

        if let Some(entry) = state.entries.get_mut(key) {
            entry.value = value;
            entry.created_at = now;
            entry.ttl = ttl;
            return;
        }

        while state.entries.len() >= self.capacity {
            match state.order.pop_first() {
                Some((_, oldest)) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key.to_string());
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                ttl,
                hits: 0,
                seq,
            },
        );
    }

    /// Remove and return a live entry; single-use tokens are consumed this way
    pub fn take(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let entry = self.lock().remove(key)?;
        (!entry.is_expired(now)).then_some(entry.value)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Remove every key matching the regular expression `pattern`
    pub fn invalidate(&self, pattern: &str) -> Result<usize, CacheError> {
        let pattern = Regex::new(pattern)?;
        let mut state = self.lock();
        let doomed: Vec<String> = state
            .entries
            .keys()
            .filter(|key| pattern.is_match(key))
            .cloned()
            .collect();
        for key in &doomed {
            state.remove(key);
        }
        Ok(doomed.len())
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn clean_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        let mut top_keys: Vec<KeyHits> = state
            .entries
            .iter()
            .map(|(key, entry)| KeyHits {
                key: key.clone(),
                hits: entry.hits,
            })
            .collect();
        top_keys.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.key.cmp(&b.key)));
        top_keys.truncate(10);

        CacheStats {
            size: state.entries.len(),
            capacity: self.capacity,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
            top_keys,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use chrono::TimeZone;

    fn cache(capacity: usize) -> (ResponseCache<String>, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap());
        let cache = ResponseCache::new(capacity, Duration::minutes(5), Arc::new(clock.clone()));
        (cache, clock)
    }

    #[test]
    fn test_round_trip_and_expiry() {
        let (cache, clock) = cache(10);
        cache.set("k", "v".to_string(), Some(Duration::seconds(30)));
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        clock.advance(Duration::seconds(30));
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        clock.advance(Duration::seconds(1));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_default_ttl() {
        let (cache, clock) = cache(10);
        cache.set("k", "v".to_string(), None);
        clock.advance(Duration::minutes(5) + Duration::seconds(1));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_insertion_order_eviction() {
        let (cache, _) = cache(3);
        for key in ["a", "b", "c"] {
            cache.set(key, key.to_string(), None);
        }
        // reading "a" does not protect it; eviction is not LRU
        assert!(cache.get("a").is_some());
        cache.set("b", "b2".to_string(), None);
        cache.set("d", "d".to_string(), None);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b").as_deref(), Some("b2"));
        assert!(cache.get("d").is_some());
    }

    #[test]
    fn test_invalidate_by_pattern() {
        let (cache, _) = cache(10);
        cache.set("api:GET:/api/letters?page=1", "x".to_string(), None);
        cache.set("api:GET:/api/letters/count", "y".to_string(), None);
        cache.set("api:GET:/api/v1/health", "z".to_string(), None);

        assert_eq!(cache.invalidate("letters").unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert!(matches!(cache.invalidate("("), Err(CacheError::InvalidPattern(_))));
    }

    #[test]
    fn test_take_consumes_once() {
        let (cache, clock) = cache(10);
        cache.set("token", "7".to_string(), None);
        assert_eq!(cache.take("token").as_deref(), Some("7"));
        assert_eq!(cache.take("token"), None);

        cache.set("late", "3".to_string(), Some(Duration::seconds(10)));
        clock.advance(Duration::seconds(11));
        assert_eq!(cache.take("late"), None);
    }

    #[test]
    fn test_clean_expired_and_stats() {
        let (cache, clock) = cache(10);
        cache.set("short", "1".to_string(), Some(Duration::seconds(10)));
        cache.set("long", "2".to_string(), Some(Duration::minutes(10)));
        cache.get("long");
        cache.get("long");
        cache.get("missing");

        clock.advance(Duration::minutes(1));
        assert_eq!(cache.clean_expired(), 1);

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.top_keys, vec![KeyHits { key: "long".to_string(), hits: 2 }]);
    }
}
