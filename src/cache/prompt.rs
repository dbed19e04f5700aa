//! Get-or-compute prompt cache with single-flight, TTL and LRU eviction.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::CacheKey;
use crate::agent::TokenUsage;
use crate::core::EngineResult;

/// Prompt cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disable to send every request upstream
    pub enabled: bool,

    /// Maximum number of live entries
    pub capacity: usize,

    /// Entry lifetime in seconds
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true, capacity: 512, ttl_secs: 3600 }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// A memoized provider response.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Immutable cache entry.
#[derive(Debug, Clone)]
pub struct PromptCacheEntry {
    pub key: CacheKey,
    pub response: Arc<CachedResponse>,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl PromptCacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

/// Outcome of [`PromptCache::get_or_compute`].
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub response: Arc<CachedResponse>,
    /// `false` only for the caller whose computation produced the value.
    pub hit: bool,
}

/// Counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

type Slot = Arc<OnceCell<Arc<CachedResponse>>>;

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, PromptCacheEntry>,
    /// Access tick -> key, oldest first.
    recency: BTreeMap<u64, CacheKey>,
    ticks: HashMap<CacheKey, u64>,
    next_tick: u64,
    inflight: HashMap<CacheKey, Slot>,
}

impl CacheState {
    fn touch(&mut self, key: &CacheKey) {
        if let Some(old) = self.ticks.remove(key) {
            self.recency.remove(&old);
        }
        self.next_tick += 1;
        self.recency.insert(self.next_tick, key.clone());
        self.ticks.insert(key.clone(), self.next_tick);
    }

    fn remove(&mut self, key: &CacheKey) {
        self.entries.remove(key);
        if let Some(tick) = self.ticks.remove(key) {
            self.recency.remove(&tick);
        }
    }

    /// Live entry for `key`, dropping it if expired.
    fn fresh(&mut self, key: &CacheKey, now: Instant) -> Option<Arc<CachedResponse>> {
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            self.remove(key);
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|e| Arc::clone(&e.response))
    }

    fn release(&mut self, key: &CacheKey, slot: &Slot) {
        if self.inflight.get(key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            self.inflight.remove(key);
        }
    }
}

/// Process-wide prompt cache.
#[derive(Debug)]
pub struct PromptCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for PromptCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl PromptCache {
    /// Create a cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Live value for `key`, if any.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedResponse>> {
        self.state.lock().fresh(key, Instant::now())
    }

    /// Return the cached value or run `compute`, at most once concurrently per key.
    ///
    /// Callers arriving while a computation for the same key is running wait
    /// for it and share its result. Errors are not cached: if the running
    /// computation fails, the next waiter runs its own.
    pub async fn get_or_compute<F, Fut>(&self, key: &CacheKey, compute: F) -> EngineResult<CacheLookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<CachedResponse>>,
    {
        if !self.config.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            let response = Arc::new(compute().await?);
            return Ok(CacheLookup { response, hit: false });
        }

        let slot = {
            let mut state = self.state.lock();
            if let Some(response) = state.fresh(key, Instant::now()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %key, "Prompt cache hit");
                return Ok(CacheLookup { response, hit: true });
            }
            Arc::clone(state.inflight.entry(key.clone()).or_default())
        };

        let mut computed = false;
        let result = slot
            .get_or_try_init(|| {
                computed = true;
                async move { compute().await.map(Arc::new) }
            })
            .await
            .map(Arc::clone);

        let mut state = self.state.lock();
        match result {
            Ok(response) => {
                if computed {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    self.insert(&mut state, key, Arc::clone(&response));
                    tracing::debug!(key = %key, "Prompt cache filled");
                } else {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = %key, "Shared in-flight prompt result");
                }
                state.release(key, &slot);
                Ok(CacheLookup { response, hit: !computed })
            }
            Err(err) => {
                // Map + our clone: nobody else is waiting on this slot.
                if Arc::strong_count(&slot) <= 2 {
                    state.release(key, &slot);
                }
                Err(err)
            }
        }
    }

    fn insert(&self, state: &mut CacheState, key: &CacheKey, response: Arc<CachedResponse>) {
        let now = Instant::now();
        if state.entries.get(key).is_some_and(|e| !e.is_expired(now)) {
            // Live entries are never rewritten.
            return;
        }

        state.remove(key);
        state.entries.insert(
            key.clone(),
            PromptCacheEntry { key: key.clone(), response, created_at: now, ttl: self.config.ttl() },
        );
        state.touch(key);

        while state.entries.len() > self.config.capacity.max(1) {
            let Some((_, oldest)) = state.recency.pop_first() else {
                break;
            };
            state.ticks.remove(&oldest);
            state.entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %oldest, "Evicted least recently used prompt");
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<CacheKey> = state
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.state.lock().entries.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::agent::SendParams;
    use crate::core::EngineError;

    fn key(prompt: &str) -> CacheKey {
        CacheKey::new(prompt, "m", &SendParams::default())
    }

    fn response(text: &str) -> CachedResponse {
        CachedResponse { text: text.to_string(), usage: TokenUsage::new(3, 4), model: "m".into() }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = PromptCache::default();

        let first = cache.get_or_compute(&key("a"), || async { Ok(response("A")) }).await.unwrap();
        assert!(!first.hit);

        let second = cache
            .get_or_compute(&key("a"), || async { Ok(response("never")) })
            .await
            .unwrap();
        assert!(second.hit);
        assert_eq!(second.response.text, "A");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_compute_once() {
        let cache = Arc::new(PromptCache::default());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&key("same"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(response("shared"))
                    })
                    .await
                    .unwrap()
            }));
        }

        let results = futures::future::join_all(handles).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let misses = results.iter().filter(|r| !r.as_ref().unwrap().hit).count();
        assert_eq!(misses, 1);
        for result in results {
            assert_eq!(result.unwrap().response.text, "shared");
        }
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = PromptCache::default();

        let err = cache
            .get_or_compute(&key("e"), || async { Err(EngineError::provider("p", "boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Provider { .. }));
        assert!(cache.is_empty());

        let ok = cache.get_or_compute(&key("e"), || async { Ok(response("ok")) }).await.unwrap();
        assert!(!ok.hit);
        assert_eq!(ok.response.text, "ok");
    }

    #[tokio::test]
    async fn test_ttl_expiry_creates_new_entry() {
        let cache = PromptCache::new(CacheConfig { enabled: true, capacity: 8, ttl_secs: 0 });

        cache.get_or_compute(&key("t"), || async { Ok(response("old")) }).await.unwrap();
        let again = cache.get_or_compute(&key("t"), || async { Ok(response("new")) }).await.unwrap();

        assert!(!again.hit);
        assert_eq!(again.response.text, "new");
        assert_eq!(cache.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = PromptCache::new(CacheConfig { enabled: true, capacity: 2, ttl_secs: 3600 });

        for name in ["a", "b"] {
            cache.get_or_compute(&key(name), || async { Ok(response(name)) }).await.unwrap();
        }
        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get(&key("a")).is_some());
        cache.get_or_compute(&key("c"), || async { Ok(response("c")) }).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_computes() {
        let cache = PromptCache::new(CacheConfig { enabled: false, ..Default::default() });
        for _ in 0..2 {
            let lookup = cache.get_or_compute(&key("d"), || async { Ok(response("d")) }).await.unwrap();
            assert!(!lookup.hit);
        }
        assert!(cache.is_empty());
    }
}
