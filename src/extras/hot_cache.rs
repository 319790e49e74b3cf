//! In-process stale-while-revalidate cache layered on the public client
//! surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::extras::client_wrapper::CacheClientTrait;
use crate::key::Key;
use crate::metrics::MetricsCollector;

struct Entry {
    value: Vec<u8>,
    inserted_at: Instant,
}

/// Per-key single-flight guard: the first reader past `ttl` to acquire a
/// key's lock performs the refresh; others block behind it and then see
/// the entry it just wrote (or remain stale, if the refresh came back
/// empty and the entry hadn't fully expired).
struct KeyLocks {
    locks: Mutex<HashMap<Key, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn new() -> Self {
        KeyLocks {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &Key) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Caches a prefix-eligible subset of keys in-process, refreshing from the
/// inner client probabilistically (stale-while-revalidate) rather than on
/// every access.
pub struct ProbabilisticHotCache {
    inner: Arc<dyn CacheClientTrait>,
    metrics: Arc<dyn MetricsCollector>,
    entries: Mutex<HashMap<Key, Entry>>,
    key_locks: KeyLocks,
    allowed_prefixes: Vec<String>,
    ttl: Duration,
    peek_rate: f64,
}

impl ProbabilisticHotCache {
    pub fn new(
        inner: Arc<dyn CacheClientTrait>,
        metrics: Arc<dyn MetricsCollector>,
        allowed_prefixes: Vec<String>,
        ttl: Duration,
        peek_rate: f64,
    ) -> Self {
        ProbabilisticHotCache {
            inner,
            metrics,
            entries: Mutex::new(HashMap::new()),
            key_locks: KeyLocks::new(),
            allowed_prefixes,
            ttl,
            peek_rate,
        }
    }

    pub fn is_eligible(&self, key: &Key) -> bool {
        self.allowed_prefixes.iter().any(|prefix| key.key().starts_with(prefix.as_str()))
    }

    fn should_peek(&self, age: Duration) -> bool {
        age >= self.ttl || rand::thread_rng().gen_bool(self.peek_rate.clamp(0.0, 1.0))
    }

    fn refresh(&self, key: &Key) -> Option<Vec<u8>> {
        match self.inner.get(key, None, None) {
            Ok(Some(value)) => {
                self.entries.lock().unwrap().insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        inserted_at: Instant::now(),
                    },
                );
                self.metrics.increment_counter("hot_cache_refresh", 1, &HashMap::new());
                Some(value)
            }
            Ok(None) => {
                // A confirmed miss upstream evicts rather than serving
                // indefinitely stale data once the entry is past `ttl`.
                let mut entries = self.entries.lock().unwrap();
                if let Some(entry) = entries.get(key) {
                    if entry.inserted_at.elapsed() >= self.ttl {
                        entries.remove(key);
                    }
                }
                None
            }
            Err(_) => None,
        }
    }

    /// Not eligible keys pass straight through to the inner client,
    /// untouched by local caching.
    pub fn get(&self, key: &Key) -> crate::error::Result<Option<Vec<u8>>> {
        if !self.is_eligible(key) {
            return self.inner.get(key, None, None);
        }

        let cached = {
            let entries = self.entries.lock().unwrap();
            entries.get(key).map(|e| (e.value.clone(), e.inserted_at.elapsed()))
        };

        match cached {
            Some((value, age)) if !self.should_peek(age) => {
                self.metrics.increment_counter("hot_cache_hit", 1, &HashMap::new());
                Ok(Some(value))
            }
            Some((stale_value, _)) => {
                self.metrics.increment_counter("hot_cache_peek", 1, &HashMap::new());
                let lock = self.key_locks.lock_for(key);
                let guard = lock.try_lock();
                match guard {
                    Ok(_) => Ok(self.refresh(key).or(Some(stale_value))),
                    Err(_) => Ok(Some(stale_value)),
                }
            }
            None => {
                self.metrics.increment_counter("hot_cache_miss", 1, &HashMap::new());
                let lock = self.key_locks.lock_for(key);
                let _guard = lock.lock().unwrap();
                Ok(self.refresh(key))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::flags::SetMode;
    use crate::serializer::CacheValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubClient {
        calls: AtomicUsize,
        value: Option<Vec<u8>>,
    }

    impl CacheClientTrait for StubClient {
        fn set(&self, _: &Key, _: &CacheValue, _: i64, _: bool, _: Option<u64>, _: Option<crate::config::StalePolicy>, _: Option<SetMode>) -> Result<bool> {
            Ok(true)
        }
        fn refill(&self, _: &Key, _: &CacheValue, _: i64, _: bool) -> Result<bool> {
            Ok(true)
        }
        fn delete(&self, _: &Key, _: Option<u64>, _: bool, _: Option<crate::config::StalePolicy>) -> Result<bool> {
            Ok(true)
        }
        fn invalidate(&self, _: &Key, _: Option<u64>, _: bool, _: Option<crate::config::StalePolicy>) -> Result<bool> {
            Ok(true)
        }
        fn get(&self, _: &Key, _: Option<i64>, _: Option<crate::config::RecachePolicy>) -> Result<Option<Vec<u8>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.clone())
        }
        fn get_cas(&self, _: &Key, _: Option<i64>, _: Option<crate::config::RecachePolicy>) -> Result<(Option<Vec<u8>>, Option<u64>)> {
            Ok((self.value.clone(), None))
        }
        fn get_or_lease(&self, _: &Key, _: &crate::config::LeasePolicy, _: Option<i64>, _: Option<crate::config::RecachePolicy>) -> Result<(Option<Vec<u8>>, Option<u64>)> {
            Ok((self.value.clone(), None))
        }
    }

    #[test]
    fn ineligible_keys_bypass_the_local_cache() {
        let inner = Arc::new(StubClient {
            calls: AtomicUsize::new(0),
            value: Some(b"v".to_vec()),
        });
        let cache = ProbabilisticHotCache::new(
            inner.clone(),
            Arc::new(crate::metrics::NoopMetrics),
            vec!["hot:".to_string()],
            Duration::from_secs(60),
            0.0,
        );
        let key = Key::new("cold:1").unwrap();
        assert!(!cache.is_eligible(&key));
        cache.get(&key).unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eligible_miss_populates_the_local_entry() {
        let inner = Arc::new(StubClient {
            calls: AtomicUsize::new(0),
            value: Some(b"v".to_vec()),
        });
        let cache = ProbabilisticHotCache::new(
            inner.clone(),
            Arc::new(crate::metrics::NoopMetrics),
            vec!["hot:".to_string()],
            Duration::from_secs(60),
            0.0,
        );
        let key = Key::new("hot:1").unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(b"v".to_vec()));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        // second read within ttl, peek_rate 0.0: served from the local
        // entry without calling the inner client again.
        assert_eq!(cache.get(&key).unwrap(), Some(b"v".to_vec()));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
