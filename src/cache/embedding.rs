//! In-memory LRU + TTL cache in front of an [`EmbeddingProvider`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

use super::provider::{BatchEmbedding, Embedding, EmbeddingProvider};
use crate::batch::{BatchOptions, BatchProcessor};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub max_size: usize,
    pub expiration: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_size: 1000,
            expiration: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub hit_rate: f64,
}

/// Cache key: sha256 over provider identity and text, hex encoded.
#[must_use]
pub fn cache_key(identity: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct CacheEntry {
    embedding: Embedding,
    inserted_at: Instant,
    tick: u64,
}

/// Entries plus a recency index. Ticks are unique, so the first key of
/// `recency` is always the least recently used entry.
#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    fn is_fresh(&self, key: &str, now: Instant, ttl: Duration) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| now.duration_since(e.inserted_at) < ttl)
    }

    /// Returns a fresh entry and marks it most recently used.
    fn touch(&mut self, key: &str, now: Instant, ttl: Duration) -> Option<Embedding> {
        if !self.is_fresh(key, now, ttl) {
            return None;
        }
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.to_string());
        Some(entry.embedding.clone())
    }

    fn insert(&mut self, key: String, embedding: Embedding, now: Instant, max_size: usize) {
        let tick = self.next_tick();
        let entry = CacheEntry {
            embedding,
            inserted_at: now,
            tick,
        };
        // An expired entry under the same key is replaced in place.
        if let Some(old) = self.entries.insert(key.clone(), entry) {
            self.recency.remove(&old.tick);
        }
        self.recency.insert(tick, key);

        while self.entries.len() > max_size {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            debug!(key = %oldest, "evicting least recently used embedding");
            self.entries.remove(&oldest);
        }
    }

    fn purge_expired(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.entries.len();
        let recency = &mut self.recency;
        self.entries.retain(|_, e| {
            let fresh = now.duration_since(e.inserted_at) < ttl;
            if !fresh {
                recency.remove(&e.tick);
            }
            fresh
        });
        before - self.entries.len()
    }
}

/// Per-key async locks so that concurrent misses on one key fill it once.
#[derive(Default)]
struct KeyLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

struct KeyLease<'a> {
    locks: &'a KeyLocks,
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    /// Keys are locked in sorted order, which rules out deadlock between
    /// overlapping batches.
    async fn acquire(&self, mut keys: Vec<String>) -> KeyLease<'_> {
        keys.sort_unstable();
        keys.dedup();

        let slots: Vec<Arc<AsyncMutex<()>>> = {
            let mut map = lock(&self.slots);
            keys.iter()
                .map(|k| map.entry(k.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(slots.len());
        for slot in slots {
            guards.push(slot.lock_owned().await);
        }

        KeyLease {
            locks: self,
            keys,
            guards,
        }
    }

    fn prune(&self, keys: &[String]) {
        let mut map = lock(&self.slots);
        for key in keys {
            if map.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                map.remove(key);
            }
        }
    }
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        self.guards.clear();
        self.locks.prune(&self.keys);
    }
}

pub struct EmbeddingCache<P> {
    provider: P,
    options: CacheOptions,
    state: Mutex<CacheState>,
    locks: KeyLocks,
}

impl<P: EmbeddingProvider> EmbeddingCache<P> {
    pub fn new(provider: P, options: CacheOptions) -> Self {
        Self {
            provider,
            options: CacheOptions {
                max_size: options.max_size.max(1),
                expiration: options.expiration,
            },
            state: Mutex::new(CacheState::default()),
            locks: KeyLocks::default(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn options(&self) -> CacheOptions {
        self.options
    }

    fn key(&self, text: &str) -> String {
        cache_key(self.provider.identity(), text)
    }

    fn lookup(&self, key: &str) -> Option<Embedding> {
        let mut state = lock(&self.state);
        let hit = state.touch(key, Instant::now(), self.options.expiration);
        if hit.is_some() {
            state.hits += 1;
        }
        hit
    }

    /// Fills empty slots from fresh entries. Returns how many were filled.
    fn fill_from_cache(&self, keys: &[String], slots: &mut [Option<Embedding>]) -> usize {
        let mut state = lock(&self.state);
        let now = Instant::now();
        let mut filled = 0;
        for (key, slot) in keys.iter().zip(slots.iter_mut()) {
            if slot.is_none() {
                *slot = state.touch(key, now, self.options.expiration);
                if slot.is_some() {
                    filled += 1;
                }
            }
        }
        filled
    }

    pub async fn embed_text(&self, text: &str) -> Result<Embedding> {
        let key = self.key(text);
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }

        let _lease = self.locks.acquire(vec![key.clone()]).await;
        if let Some(hit) = self.lookup(&key) {
            return Ok(hit);
        }

        let embedding = self.provider.embed_text(text).await?;
        let mut state = lock(&self.state);
        state.misses += 1;
        state.insert(key, embedding.clone(), Instant::now(), self.options.max_size);
        Ok(embedding)
    }

    /// Embeds `texts` in order, sending only uncached texts to the provider
    /// in a single call. `total_tokens` and `cost` cover that call only.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<BatchEmbedding> {
        if texts.is_empty() {
            return Ok(BatchEmbedding::default());
        }

        let keys: Vec<String> = texts.iter().map(|t| self.key(t)).collect();
        let mut slots: Vec<Option<Embedding>> = vec![None; texts.len()];
        let mut hits = self.fill_from_cache(&keys, &mut slots);

        let mut total_tokens = 0;
        let mut cost = 0.0;
        if hits < texts.len() {
            let pending: Vec<String> = keys
                .iter()
                .zip(&slots)
                .filter(|(_, slot)| slot.is_none())
                .map(|(key, _)| key.clone())
                .collect();
            let _lease = self.locks.acquire(pending).await;
            hits += self.fill_from_cache(&keys, &mut slots);

            let mut seen = HashSet::new();
            let mut uncached: Vec<(String, String)> = Vec::new();
            for ((key, text), slot) in keys.iter().zip(texts).zip(&slots) {
                if slot.is_none() && seen.insert(key) {
                    uncached.push((key.clone(), text.clone()));
                }
            }

            if !uncached.is_empty() {
                let request: Vec<String> = uncached.iter().map(|(_, t)| t.clone()).collect();
                debug!(requested = request.len(), cached = hits, "embedding cache miss");
                let response = self.provider.embed_batch(&request).await?;
                if response.embeddings.len() != request.len() {
                    return Err(Error::Provider(format!(
                        "provider '{}' returned {} embeddings for {} texts",
                        self.provider.identity(),
                        response.embeddings.len(),
                        request.len()
                    )));
                }
                total_tokens = response.total_tokens;
                cost = response.cost;

                let fresh: Vec<(String, Embedding)> = uncached
                    .into_iter()
                    .map(|(key, _)| key)
                    .zip(response.embeddings)
                    .collect();
                {
                    let mut state = lock(&self.state);
                    let now = Instant::now();
                    for (key, embedding) in &fresh {
                        state.insert(key.clone(), embedding.clone(), now, self.options.max_size);
                    }
                }

                let by_key: HashMap<&str, &Embedding> =
                    fresh.iter().map(|(k, e)| (k.as_str(), e)).collect();
                for (key, slot) in keys.iter().zip(slots.iter_mut()) {
                    if slot.is_none() {
                        *slot = by_key.get(key.as_str()).map(|e| (*e).clone());
                    }
                }
            }
        }

        let mut state = lock(&self.state);
        state.hits += hits as u64;
        state.misses += (texts.len() - hits) as u64;
        drop(state);

        Ok(BatchEmbedding {
            embeddings: slots.into_iter().flatten().collect(),
            total_tokens,
            cost,
        })
    }

    /// Drives `embed_batch` over `texts` in chunks of `batch_size`, stopping
    /// at the first failing chunk. The abort error lists the texts already
    /// embedded; those stay cached.
    pub async fn embed_many(&self, texts: &[String], batch_size: usize) -> Result<BatchEmbedding> {
        let totals = Mutex::new((0u64, 0.0f64));
        let processor = BatchProcessor::new(BatchOptions {
            batch_size,
            concurrency: 1,
            continue_on_error: false,
        });

        let outcome = processor
            .process(texts.to_vec(), |chunk: Vec<String>| {
                let totals = &totals;
                async move {
                    let batch = self.embed_batch(&chunk).await?;
                    let mut totals = lock(totals);
                    totals.0 += batch.total_tokens;
                    totals.1 += batch.cost;
                    Ok::<_, Error>(batch.embeddings)
                }
            })
            .await
            .map_err(|aborted| aborted.into_error(|embedding: &Embedding| embedding.text.clone()))?;

        let (total_tokens, cost) = *lock(&totals);
        Ok(BatchEmbedding {
            embeddings: outcome.successful,
            total_tokens,
            cost,
        })
    }

    /// True if a fresh entry exists. Does not affect recency or stats.
    pub fn has(&self, text: &str) -> bool {
        let key = self.key(text);
        lock(&self.state).is_fresh(&key, Instant::now(), self.options.expiration)
    }

    pub fn size(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        let lookups = state.hits + state.misses;
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            size: state.entries.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }

    /// Drops every entry. Hit and miss counters are kept.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.recency.clear();
    }

    pub fn reset_stats(&self) {
        let mut state = lock(&self.state);
        state.hits = 0;
        state.misses = 0;
    }

    pub fn purge_expired(&self) -> usize {
        let removed = lock(&self.state).purge_expired(Instant::now(), self.options.expiration);
        if removed > 0 {
            debug!(removed, "purged expired embeddings");
        }
        removed
    }
}

#[async_trait]
impl<P: EmbeddingProvider> EmbeddingProvider for EmbeddingCache<P> {
    fn identity(&self) -> &str {
        self.provider.identity()
    }

    async fn embed_text(&self, text: &str) -> Result<Embedding> {
        EmbeddingCache::embed_text(self, text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<BatchEmbedding> {
        EmbeddingCache::embed_batch(self, texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockProvider {
        identity: String,
        delay: Duration,
        text_calls: AtomicUsize,
        batch_calls: Mutex<Vec<Vec<String>>>,
    }

    impl MockProvider {
        fn new(identity: &str) -> Arc<Self> {
            Self::with_delay(identity, Duration::ZERO)
        }

        fn with_delay(identity: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                identity: identity.to_string(),
                delay,
                text_calls: AtomicUsize::new(0),
                batch_calls: Mutex::new(Vec::new()),
            })
        }

        fn text_calls(&self) -> usize {
            self.text_calls.load(Ordering::SeqCst)
        }

        fn batch_calls(&self) -> Vec<Vec<String>> {
            self.batch_calls.lock().unwrap().clone()
        }
    }

    fn fake_embedding(text: &str) -> Embedding {
        Embedding {
            embedding: vec![text.len() as f32, 0.5],
            text: text.to_string(),
            token_count: text.len() as u32,
        }
    }

    #[async_trait]
    impl EmbeddingProvider for MockProvider {
        fn identity(&self) -> &str {
            &self.identity
        }

        async fn embed_text(&self, text: &str) -> Result<Embedding> {
            self.text_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if text == "fail" {
                return Err(Error::Provider("mock failure".to_string()));
            }
            Ok(fake_embedding(text))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<BatchEmbedding> {
            self.batch_calls.lock().unwrap().push(texts.to_vec());
            if texts.iter().any(|t| t == "fail") {
                return Err(Error::Provider("mock failure".to_string()));
            }
            let embeddings: Vec<Embedding> = texts.iter().map(|t| fake_embedding(t)).collect();
            let total_tokens = embeddings.iter().map(|e| u64::from(e.token_count)).sum();
            Ok(BatchEmbedding {
                embeddings,
                total_tokens,
                cost: 0.0,
            })
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_hit_rate_progression() {
        let provider = MockProvider::new("mock/small");
        let cache = EmbeddingCache::new(provider.clone(), CacheOptions::default());

        let first = cache.embed_text("hello").await.unwrap();
        assert_eq!(first.text, "hello");
        assert_eq!(cache.hit_rate(), 0.0);

        cache.embed_text("hello").await.unwrap();
        assert_eq!(cache.hit_rate(), 0.5);

        cache.embed_text("hello").await.unwrap();
        assert!((cache.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(provider.text_calls(), 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (2, 1, 1));
    }

    #[tokio::test]
    async fn test_batch_only_requests_uncached_texts() {
        let provider = MockProvider::new("mock/small");
        let cache = EmbeddingCache::new(provider.clone(), CacheOptions::default());
        for text in ["a", "b", "c"] {
            cache.embed_text(text).await.unwrap();
        }

        let result = cache.embed_batch(&strings(&["a", "b", "c", "d"])).await.unwrap();
        let texts: Vec<&str> = result.embeddings.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c", "d"]);
        assert_eq!(provider.batch_calls(), vec![strings(&["d"])]);
        assert_eq!(result.total_tokens, 1);

        let again = cache.embed_batch(&strings(&["d", "a"])).await.unwrap();
        assert_eq!(again.embeddings.len(), 2);
        assert_eq!(again.total_tokens, 0);
        assert_eq!(provider.batch_calls().len(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 5);
        assert_eq!(stats.misses, 4);
    }

    #[tokio::test]
    async fn test_batch_deduplicates_uncached_texts() {
        let provider = MockProvider::new("mock/small");
        let cache = EmbeddingCache::new(provider.clone(), CacheOptions::default());

        let result = cache.embed_batch(&strings(&["x", "yy", "x"])).await.unwrap();
        assert_eq!(result.embeddings.len(), 3);
        assert_eq!(result.embeddings[0], result.embeddings[2]);
        assert_eq!(provider.batch_calls(), vec![strings(&["x", "yy"])]);
        assert_eq!(cache.stats().misses, 3);
        assert_eq!(cache.size(), 2);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_used() {
        let provider = MockProvider::new("mock/small");
        let cache = EmbeddingCache::new(
            provider,
            CacheOptions {
                max_size: 2,
                ..CacheOptions::default()
            },
        );

        cache.embed_text("a").await.unwrap();
        cache.embed_text("b").await.unwrap();
        cache.embed_text("a").await.unwrap();
        cache.embed_text("c").await.unwrap();

        assert_eq!(cache.size(), 2);
        assert!(cache.has("a"));
        assert!(!cache.has("b"));
        assert!(cache.has("c"));
    }

    #[tokio::test]
    async fn test_touched_key_survives_eviction_at_capacity_ten() {
        let provider = MockProvider::new("mock/small");
        let cache = EmbeddingCache::new(
            provider.clone(),
            CacheOptions {
                max_size: 10,
                ..CacheOptions::default()
            },
        );

        let keys: Vec<String> = (0..10).map(|i| format!("key-{i}")).collect();
        for key in &keys {
            cache.embed_text(key).await.unwrap();
        }
        cache.embed_text(&keys[0]).await.unwrap();
        cache.embed_text("key-10").await.unwrap();

        assert_eq!(cache.size(), 10);
        assert!(cache.has(&keys[0]));
        assert!(!cache.has(&keys[1]));
        assert!(keys[2..].iter().all(|key| cache.has(key)));
        assert!(cache.has("key-10"));
        assert_eq!(provider.text_calls(), 11);
    }

    #[tokio::test]
    async fn test_has_does_not_refresh_recency() {
        let cache = EmbeddingCache::new(
            MockProvider::new("mock/small"),
            CacheOptions {
                max_size: 2,
                ..CacheOptions::default()
            },
        );

        cache.embed_text("a").await.unwrap();
        cache.embed_text("b").await.unwrap();
        assert!(cache.has("a"));
        cache.embed_text("c").await.unwrap();

        assert!(!cache.has("a"));
        assert!(cache.has("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let provider = MockProvider::new("mock/small");
        let cache = EmbeddingCache::new(
            provider.clone(),
            CacheOptions {
                max_size: 10,
                expiration: Duration::from_secs(60),
            },
        );

        cache.embed_text("a").await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.embed_text("b").await.unwrap();
        assert!(cache.has("a"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!cache.has("a"));
        assert!(cache.has("b"));

        cache.embed_text("a").await.unwrap();
        assert_eq!(provider.text_calls(), 3);
        assert_eq!(cache.size(), 2);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.size(), 1);
        assert!(cache.has("a"));
    }

    #[tokio::test]
    async fn test_clear_keeps_counters() {
        let cache = EmbeddingCache::new(MockProvider::new("mock/small"), CacheOptions::default());
        cache.embed_text("a").await.unwrap();
        cache.embed_text("a").await.unwrap();

        cache.clear();
        assert_eq!(cache.size(), 0);
        assert!(!cache.has("a"));
        assert_eq!(cache.hit_rate(), 0.5);

        cache.reset_stats();
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (0, 0));
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[tokio::test]
    async fn test_provider_identity_is_part_of_key() {
        assert_ne!(cache_key("openai/small", "text"), cache_key("openai/large", "text"));
        assert_eq!(cache_key("openai/small", "text"), cache_key("openai/small", "text"));
        assert_eq!(cache_key("m", "t").len(), 64);

        let cache = EmbeddingCache::new(MockProvider::new("mock/small"), CacheOptions::default());
        let other = EmbeddingCache::new(MockProvider::new("mock/large"), CacheOptions::default());
        cache.embed_text("shared").await.unwrap();
        assert!(cache.has("shared"));
        assert!(!other.has("shared"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_call_provider_once() {
        let provider = MockProvider::with_delay("mock/slow", Duration::from_millis(50));
        let cache = EmbeddingCache::new(provider.clone(), CacheOptions::default());

        let (a, b) = tokio::join!(cache.embed_text("same"), cache.embed_text("same"));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(provider.text_calls(), 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!(cache.locks.slots.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_caches_nothing() {
        let provider = MockProvider::new("mock/small");
        let cache = EmbeddingCache::new(provider, CacheOptions::default());

        assert!(cache.embed_batch(&strings(&["ok", "fail"])).await.is_err());
        assert_eq!(cache.size(), 0);
        assert!(cache.embed_text("fail").await.is_err());
        assert_eq!(cache.stats().misses, 0);
    }

    #[tokio::test]
    async fn test_embed_many_chunks_through_batches() {
        let provider = MockProvider::new("mock/small");
        let cache = EmbeddingCache::new(provider.clone(), CacheOptions::default());

        let texts = strings(&["a", "bb", "ccc", "dddd", "eeeee"]);
        let result = cache.embed_many(&texts, 2).await.unwrap();

        let order: Vec<&str> = result.embeddings.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(order, vec!["a", "bb", "ccc", "dddd", "eeeee"]);
        assert_eq!(result.total_tokens, 15);
        assert_eq!(provider.batch_calls().len(), 3);

        let err = cache
            .embed_many(&strings(&["x", "fail", "y"]), 1)
            .await
            .unwrap_err();
        match err {
            Error::BatchAborted {
                batch,
                total,
                completed,
                ..
            } => {
                assert_eq!((batch, total), (2, 3));
                assert_eq!(completed, vec!["x"]);
            }
            other => panic!("expected BatchAborted, got {other:?}"),
        }
        assert!(cache.has("x"));
    }

    #[tokio::test]
    async fn test_cache_stacks_as_provider() {
        let provider = MockProvider::new("mock/small");
        let inner = Arc::new(EmbeddingCache::new(provider.clone(), CacheOptions::default()));
        let outer = EmbeddingCache::new(inner.clone(), CacheOptions::default());

        outer.embed_text("a").await.unwrap();
        outer.clear();
        outer.embed_text("a").await.unwrap();

        assert_eq!(outer.identity(), "mock/small");
        assert_eq!(provider.text_calls(), 1);
        assert_eq!(inner.stats().hits, 1);
    }
}
