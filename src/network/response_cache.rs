//! Size-bounded response cache with LRU or age-based eviction
//!
//! Entries are keyed by a normalized request identity ([`CacheKey`]) and
//! expire according to the response's freshness directives, falling back to
//! the configured default TTL. All operations run under a single mutex, so
//! concurrent stores for one key are serialized and the later one wins.

use crate::config::{CacheKeyPolicy, ExpirationPolicy, NetworkConfig, QueryNormalization};
use crate::network::http::{Request, Response};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Normalized request identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for `request` under `policy`: method, normalized URL and
    /// the values of the configured vary headers
    pub fn from_request(request: &Request, policy: &CacheKeyPolicy) -> Self {
        let mut key = format!(
            "{} {}",
            request.method(),
            normalize_url(request.url(), policy.query)
        );
        for name in &policy.vary_headers {
            if let Some(value) = request.headers().get(name) {
                key.push_str(&format!("\n{}: {}", name.to_ascii_lowercase(), value.trim()));
            }
        }
        CacheKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase scheme and host, drop the default port and the fragment, and
/// treat the query according to `query`
pub fn normalize_url(url: &Url, query: QueryNormalization) -> String {
    let mut normalized = format!("{}://", url.scheme().to_ascii_lowercase());
    if let Some(host) = url.host_str() {
        normalized.push_str(&host.to_ascii_lowercase());
    }
    // `port()` is None when the port is the scheme default
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(url.path());

    match (query, url.query()) {
        (_, None) | (QueryNormalization::Ignore, _) => {}
        (QueryNormalization::Preserve, Some(q)) => {
            normalized.push('?');
            normalized.push_str(q);
        }
        (QueryNormalization::Sorted, Some(_)) => {
            let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
            pairs.sort();
            let sorted = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            normalized.push('?');
            normalized.push_str(&sorted);
        }
    }
    normalized
}

/// Response cache settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCacheConfig {
    /// Upper bound on the summed size of all entries
    pub max_bytes: usize,
    pub policy: ExpirationPolicy,
    /// Freshness for responses without freshness directives
    pub default_ttl: Duration,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for ResponseCacheConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_bytes: config.cache_max_bytes,
            policy: config.cache_policy,
            default_ttl: Duration::from_secs(config.cache_default_ttl_secs),
        }
    }
}

struct CacheEntry {
    response: Response,
    expires_at: Instant,
    size: usize,
    /// Insertion order, for age-based eviction
    inserted: u64,
    /// Access order, for LRU eviction
    accessed: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    total_bytes: usize,
    clock: u64,
}

impl CacheInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes -= entry.size;
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Drop the entry the policy ranks first for eviction
    fn evict_one(&mut self, policy: ExpirationPolicy) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| match policy {
                ExpirationPolicy::Lru => entry.accessed,
                ExpirationPolicy::Age => entry.inserted,
            })
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => {
                self.remove(&key);
                true
            }
            None => false,
        }
    }
}

/// Cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub insertions: AtomicU64,
    /// Entries dropped to make room
    pub evictions: AtomicU64,
    /// Entries dropped because they went stale
    pub expirations: AtomicU64,
    /// Responses refused (not cacheable, already stale, or too large)
    pub rejected: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Response cache
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    config: RwLock<ResponseCacheConfig>,
    stats: CacheStats,
}

impl ResponseCache {
    pub fn new(config: ResponseCacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            config: RwLock::new(config),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn config(&self) -> ResponseCacheConfig {
        self.config.read().clone()
    }

    /// Look up a fresh response; a stale entry is removed and reported as a miss
    pub fn get(&self, key: &CacheKey) -> Option<Response> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove(key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Cache entry for {} expired", key);
            return None;
        }

        let tick = inner.tick();
        let entry = inner.entries.get_mut(key)?;
        entry.accessed = tick;
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.response.clone())
    }

    /// Store a copy of `response`, evicting by policy until it fits.
    ///
    /// Returns `false` when the response is not stored: not cacheable,
    /// without any freshness, or larger than the whole cache.
    pub fn set(&self, key: CacheKey, response: &Response) -> bool {
        let config = self.config();

        if !response.is_cacheable() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let ttl = response.freshness_lifetime().unwrap_or(config.default_ttl);
        if ttl.is_zero() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let size = key.as_str().len() + response.byte_size();
        if size > config.max_bytes {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Response for {} too large to cache ({} bytes)", key, size);
            return false;
        }

        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.remove(&key);

        if inner.total_bytes + size > config.max_bytes {
            let purged = inner.purge_expired(now);
            self.stats.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        }
        while inner.total_bytes + size > config.max_bytes {
            if !inner.evict_one(config.policy) {
                break;
            }
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let tick = inner.tick();
        inner.total_bytes += size;
        inner.entries.insert(
            key,
            CacheEntry {
                response: response.clone(),
                expires_at: now + ttl,
                size,
                inserted: tick,
                accessed: tick,
            },
        );
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remove one entry
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    /// Drop stale entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let purged = self.inner.lock().purge_expired(Instant::now());
        self.stats.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Apply new settings; a smaller bound evicts immediately
    pub fn reconfigure(&self, config: ResponseCacheConfig) {
        let max_bytes = config.max_bytes;
        let policy = config.policy;
        *self.config.write() = config;

        let mut inner = self.inner.lock();
        let purged = inner.purge_expired(Instant::now());
        self.stats.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        while inner.total_bytes > max_bytes && inner.evict_one(policy) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Summed size of all entries
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::http::{Headers, Method};

    fn response(body: &str) -> Response {
        Response::new(200, "OK", Headers::new(), body.as_bytes().to_vec())
    }

    fn key(url: &str) -> CacheKey {
        CacheKey::from_request(&Request::get(url).unwrap(), &CacheKeyPolicy::default())
    }

    fn cache(max_bytes: usize, policy: ExpirationPolicy) -> ResponseCache {
        ResponseCache::new(ResponseCacheConfig {
            max_bytes,
            policy,
            default_ttl: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_key_normalization() {
        assert_eq!(key("HTTP://Example.COM:80/a#frag"), key("http://example.com/a"));
        assert_ne!(key("http://example.com:8080/a"), key("http://example.com/a"));
        assert_ne!(key("http://example.com/a?x=1"), key("http://example.com/a"));
    }

    #[test]
    fn test_key_query_policies() {
        let url = Url::parse("http://h/p?b=2&a=1").unwrap();
        assert_eq!(normalize_url(&url, QueryNormalization::Preserve), "http://h/p?b=2&a=1");
        assert_eq!(normalize_url(&url, QueryNormalization::Sorted), "http://h/p?a=1&b=2");
        assert_eq!(normalize_url(&url, QueryNormalization::Ignore), "http://h/p");
    }

    #[test]
    fn test_key_includes_method_and_vary_headers() {
        let policy = CacheKeyPolicy::default();
        let get = Request::get("http://h/p").unwrap();
        let head = Request::new(Method::Head, "http://h/p").unwrap();
        assert_ne!(CacheKey::from_request(&get, &policy), CacheKey::from_request(&head, &policy));

        let json = Request::get("http://h/p").unwrap().header("Accept", "application/json");
        let html = Request::get("http://h/p").unwrap().header("Accept", "text/html");
        assert_ne!(CacheKey::from_request(&json, &policy), CacheKey::from_request(&html, &policy));

        // headers outside the vary list do not split entries
        let traced = Request::get("http://h/p").unwrap().header("X-Trace", "1");
        assert_eq!(CacheKey::from_request(&traced, &policy), CacheKey::from_request(&get, &policy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_after_set_until_expiry() {
        let cache = cache(1 << 20, ExpirationPolicy::Lru);
        assert!(cache.set(key("http://h/a"), &response("alpha")));

        assert_eq!(cache.get(&key("http://h/a")).unwrap().body(), b"alpha");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(&key("http://h/a")).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_age_overrides_default_ttl() {
        let cache = cache(1 << 20, ExpirationPolicy::Lru);
        let mut headers = Headers::new();
        headers.insert("cache-control", "max-age=5");
        cache.set(key("http://h/a"), &Response::new(200, "OK", headers, b"x".to_vec()));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get(&key("http://h/a")).is_none());
    }

    #[test]
    fn test_uncacheable_not_stored() {
        let cache = cache(1 << 20, ExpirationPolicy::Lru);

        let mut headers = Headers::new();
        headers.insert("cache-control", "no-store");
        assert!(!cache.set(key("http://h/a"), &Response::new(200, "OK", headers, Vec::new())));
        assert!(!cache.set(key("http://h/b"), &Response::new(500, "Oops", Headers::new(), Vec::new())));
        assert!(!cache.set(key("http://h/c"), &response("forced").with_cacheable(false)));

        assert!(cache.is_empty());
        assert_eq!(cache.stats().rejected.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let cache = cache(64, ExpirationPolicy::Lru);
        assert!(!cache.set(key("http://h/big"), &response(&"x".repeat(100))));
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_lru_evicts_least_recently_accessed() {
        let entry_size = key("http://h/a").as_str().len() + response("aaaa").byte_size();
        let cache = cache(entry_size * 2, ExpirationPolicy::Lru);

        cache.set(key("http://h/a"), &response("aaaa"));
        cache.set(key("http://h/b"), &response("bbbb"));
        assert!(cache.get(&key("http://h/a")).is_some());
        cache.set(key("http://h/c"), &response("cccc"));

        assert!(cache.get(&key("http://h/a")).is_some());
        assert!(cache.get(&key("http://h/b")).is_none());
        assert!(cache.get(&key("http://h/c")).is_some());
        assert!(cache.total_bytes() <= entry_size * 2);
    }

    #[test]
    fn test_age_evicts_oldest_insertion() {
        let entry_size = key("http://h/a").as_str().len() + response("aaaa").byte_size();
        let cache = cache(entry_size * 2, ExpirationPolicy::Age);

        cache.set(key("http://h/a"), &response("aaaa"));
        cache.set(key("http://h/b"), &response("bbbb"));
        assert!(cache.get(&key("http://h/a")).is_some());
        cache.set(key("http://h/c"), &response("cccc"));

        assert!(cache.get(&key("http://h/a")).is_none());
        assert!(cache.get(&key("http://h/b")).is_some());
    }

    #[test]
    fn test_overwrite_same_key_keeps_size_consistent() {
        let cache = cache(1 << 20, ExpirationPolicy::Lru);
        cache.set(key("http://h/a"), &response("short"));
        cache.set(key("http://h/a"), &response("a much longer body"));

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.total_bytes(),
            key("http://h/a").as_str().len() + response("a much longer body").byte_size()
        );
        assert_eq!(cache.get(&key("http://h/a")).unwrap().body(), b"a much longer body");
    }

    #[test]
    fn test_reconfigure_smaller_bound_evicts() {
        let cache = cache(1 << 20, ExpirationPolicy::Lru);
        for i in 0..10 {
            cache.set(key(&format!("http://h/{}", i)), &response("payload"));
        }
        let one = cache.total_bytes() / 10;

        cache.reconfigure(ResponseCacheConfig {
            max_bytes: one * 3,
            policy: ExpirationPolicy::Lru,
            default_ttl: Duration::from_secs(60),
        });
        assert!(cache.total_bytes() <= one * 3);
        assert!(cache.get(&key("http://h/9")).is_some());
    }

    #[test]
    fn test_clear_and_stats() {
        let cache = cache(1 << 20, ExpirationPolicy::Lru);
        cache.set(key("http://h/a"), &response("a"));
        let _ = cache.get(&key("http://h/a"));
        let _ = cache.get(&key("http://h/missing"));
        assert!((cache.stats().hit_rate() - 0.5).abs() < 0.001);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }
}
