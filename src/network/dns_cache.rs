//! Name resolution with positive/negative caching and query coalescing
//!
//! [`DnsCache`] is the storage layer: a bounded positive cache plus a separate
//! negative cache with its own, shorter TTL. [`Resolver`] sits on top of it and
//! guarantees at most one in-flight [`NameService`] query per hostname.

use crate::config::NetworkConfig;
use crate::network::errors::FetchError;
use crate::network::protocols::{parse_answer, DnsAnswer, DnsQuery, DnsRcode};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;

/// Configuration for DNS cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsCacheConfig {
    /// Maximum entries in each of the positive and negative caches
    pub max_entries: usize,
    /// Default TTL for cached entries
    pub default_ttl: Duration,
    /// TTL for negative cache entries (failed lookups)
    pub negative_ttl: Duration,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(30),
        }
    }
}

impl From<&NetworkConfig> for DnsCacheConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_entries: config.dns_cache_size.max(1),
            default_ttl: Duration::from_secs(config.dns_ttl_secs),
            negative_ttl: Duration::from_secs(config.dns_negative_ttl_secs),
        }
    }
}

/// A cached DNS entry
#[derive(Debug, Clone)]
pub struct DnsCacheEntry {
    /// Resolved IP addresses
    pub addresses: Vec<IpAddr>,
    /// When this entry was created
    pub created_at: Instant,
    /// Time-to-live for this entry
    pub ttl: Duration,
    /// Number of times this entry was accessed
    pub hit_count: u64,
    /// Whether this is a negative cache entry (lookup failed)
    pub is_negative: bool,
    /// Error message for negative entries
    pub error: Option<String>,
}

impl DnsCacheEntry {
    /// Create a positive cache entry
    pub fn positive(addresses: Vec<IpAddr>, ttl: Duration) -> Self {
        Self {
            addresses,
            created_at: Instant::now(),
            ttl,
            hit_count: 0,
            is_negative: false,
            error: None,
        }
    }

    /// Create a negative cache entry (failed lookup)
    pub fn negative(error: String, ttl: Duration) -> Self {
        Self {
            addresses: Vec::new(),
            created_at: Instant::now(),
            ttl,
            hit_count: 0,
            is_negative: true,
            error: Some(error),
        }
    }

    /// Check if this entry has expired
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }

    /// Remaining TTL
    pub fn remaining_ttl(&self) -> Duration {
        self.ttl.saturating_sub(self.created_at.elapsed())
    }
}

/// DNS cache statistics
#[derive(Debug, Default)]
pub struct DnsCacheStats {
    /// Cache hits
    pub hits: AtomicU64,
    /// Cache misses
    pub misses: AtomicU64,
    /// Entries evicted (LRU or expired)
    pub evictions: AtomicU64,
    /// Negative cache hits
    pub negative_hits: AtomicU64,
}

impl DnsCacheStats {
    /// Calculate hit rate
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

type EntryMap = HashMap<String, DnsCacheEntry>;

/// DNS cache for storing resolved hostnames
pub struct DnsCache {
    positive: RwLock<EntryMap>,
    negative: RwLock<EntryMap>,
    config: RwLock<DnsCacheConfig>,
    stats: DnsCacheStats,
}

impl DnsCache {
    /// Create a new DNS cache with default configuration
    pub fn new() -> Self {
        Self::with_config(DnsCacheConfig::default())
    }

    /// Create a new DNS cache with custom configuration
    pub fn with_config(config: DnsCacheConfig) -> Self {
        Self {
            positive: RwLock::new(HashMap::new()),
            negative: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
            stats: DnsCacheStats::default(),
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> &DnsCacheStats {
        &self.stats
    }

    pub fn config(&self) -> DnsCacheConfig {
        self.config.read().clone()
    }

    /// Replace the configuration, shrinking both caches to the new bound
    pub fn reconfigure(&self, config: DnsCacheConfig) {
        let max = config.max_entries;
        *self.config.write() = config;
        for map in [&self.positive, &self.negative] {
            let mut entries = map.write();
            while entries.len() > max {
                if !self.evict_one_lru(&mut entries) {
                    break;
                }
            }
        }
    }

    /// Look up a hostname in the cache.
    ///
    /// Positive entries take precedence; expired entries are dropped and
    /// count as misses.
    pub fn get(&self, hostname: &str) -> Option<DnsCacheEntry> {
        let key = hostname.to_lowercase();

        for map in [&self.positive, &self.negative] {
            let mut entries = map.write();
            if let Some(entry) = entries.get_mut(&key) {
                if entry.is_expired() {
                    entries.remove(&key);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                entry.hit_count += 1;
                if entry.is_negative {
                    self.stats.negative_hits.fetch_add(1, Ordering::Relaxed);
                }
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.clone());
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert a successful lookup into the cache
    pub fn insert(&self, hostname: &str, addresses: Vec<IpAddr>) {
        let ttl = self.config.read().default_ttl;
        self.insert_with_ttl(hostname, addresses, ttl);
    }

    /// Insert a successful lookup with custom TTL.
    ///
    /// A positive answer supersedes any negative entry for the host.
    pub fn insert_with_ttl(&self, hostname: &str, addresses: Vec<IpAddr>, ttl: Duration) {
        let key = hostname.to_lowercase();
        self.negative.write().remove(&key);
        self.insert_into(&self.positive, key, DnsCacheEntry::positive(addresses, ttl));
    }

    /// Insert a failed lookup (negative caching)
    pub fn insert_negative(&self, hostname: &str, error: String) {
        let key = hostname.to_lowercase();
        let ttl = self.config.read().negative_ttl;
        self.insert_into(&self.negative, key, DnsCacheEntry::negative(error, ttl));
    }

    fn insert_into(&self, map: &RwLock<EntryMap>, key: String, entry: DnsCacheEntry) {
        let max_entries = self.config.read().max_entries;
        let mut entries = map.write();

        if entries.len() >= max_entries && !entries.contains_key(&key) {
            self.evict_one_lru(&mut entries);
        }

        entries.insert(key, entry);
    }

    /// Remove a specific entry from both caches
    pub fn remove(&self, hostname: &str) {
        let key = hostname.to_lowercase();
        self.positive.write().remove(&key);
        self.negative.write().remove(&key);
    }

    /// Evict one entry using LRU policy (lowest hit count + oldest)
    fn evict_one_lru(&self, entries: &mut EntryMap) -> bool {
        let mut victim_key: Option<String> = None;
        let mut lowest_score = u64::MAX;

        for (key, entry) in entries.iter() {
            // expired entries go first
            if entry.is_expired() {
                victim_key = Some(key.clone());
                break;
            }
            // Score based on hit count and age (lower is more evictable)
            let age_secs = entry.created_at.elapsed().as_secs();
            let score = entry
                .hit_count
                .saturating_mul(10)
                .saturating_add(1000u64.saturating_sub(age_secs.min(1000)));

            if score < lowest_score {
                lowest_score = score;
                victim_key = Some(key.clone());
            }
        }

        match victim_key {
            Some(key) => {
                entries.remove(&key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Clean up expired entries
    pub fn cleanup(&self) {
        for map in [&self.positive, &self.negative] {
            let mut entries = map.write();
            let before_len = entries.len();
            entries.retain(|_, entry| !entry.is_expired());
            let removed = before_len - entries.len();
            if removed > 0 {
                self.stats.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            }
        }
    }

    /// Number of positive entries
    pub fn size(&self) -> usize {
        self.positive.read().len()
    }

    /// Number of negative entries
    pub fn negative_size(&self) -> usize {
        self.negative.read().len()
    }

    /// Clear both caches
    pub fn clear(&self) {
        self.positive.write().clear();
        self.negative.write().clear();
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// NAME SERVICES
// =============================================================================

/// Addresses returned by a name service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub addresses: Vec<IpAddr>,
    /// Record TTL, when the service knows it
    pub ttl: Option<Duration>,
}

/// Why a name service could not produce addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupFailure {
    pub reason: String,
    /// Nameserver trouble rather than a definitive "no such host"
    pub temporary: bool,
}

impl LookupFailure {
    pub fn definitive(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            temporary: false,
        }
    }

    pub fn temporary(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            temporary: true,
        }
    }
}

/// Backend that answers hostname queries
#[async_trait]
pub trait NameService: Send + Sync {
    async fn lookup(&self, hostname: &str) -> Result<Lookup, LookupFailure>;

    /// Human-readable description of the servers used, for diagnostics
    fn describe(&self) -> String;
}

/// Resolver backed by the operating system (`getaddrinfo`)
#[derive(Debug, Default, Clone)]
pub struct SystemNameService;

#[async_trait]
impl NameService for SystemNameService {
    async fn lookup(&self, hostname: &str) -> Result<Lookup, LookupFailure> {
        let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((hostname, 0)).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                let message = e.to_string();
                let lowered = message.to_lowercase();
                let temporary = e.kind() == std::io::ErrorKind::TimedOut
                    || lowered.contains("temporary")
                    || lowered.contains("try again");
                return Err(LookupFailure {
                    reason: format!("DNS lookup failed: {}", message),
                    temporary,
                });
            }
        };

        if addrs.is_empty() {
            return Err(LookupFailure::definitive("No addresses found"));
        }

        let mut addresses: Vec<IpAddr> = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if !addresses.contains(&addr.ip()) {
                addresses.push(addr.ip());
            }
        }
        Ok(Lookup {
            addresses,
            ttl: None,
        })
    }

    fn describe(&self) -> String {
        "system resolver".to_string()
    }
}

/// Resolver that queries the configured nameservers over UDP, in order
#[derive(Debug, Clone)]
pub struct UdpNameService {
    servers: Vec<SocketAddr>,
    timeout: Duration,
}

impl UdpNameService {
    pub fn new(servers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    async fn query(&self, server: SocketAddr, query: DnsQuery) -> Result<DnsAnswer, String> {
        let bind: SocketAddr = if server.is_ipv6() {
            "[::]:0".parse().map_err(|e| format!("{}", e))?
        } else {
            "0.0.0.0:0".parse().map_err(|e| format!("{}", e))?
        };
        let socket = UdpSocket::bind(bind).await.map_err(|e| e.to_string())?;
        socket.connect(server).await.map_err(|e| e.to_string())?;
        socket.send(&query.build()).await.map_err(|e| e.to_string())?;

        let mut buf = [0u8; 1500];
        let deadline = Instant::now() + self.timeout;
        loop {
            let len = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| format!("timed out after {:?}", self.timeout))?
                .map_err(|e| e.to_string())?;
            let answer = parse_answer(&buf[..len])?;
            // ignore stray datagrams for other transactions
            if answer.id == query.id() {
                return Ok(answer);
            }
        }
    }
}

#[async_trait]
impl NameService for UdpNameService {
    async fn lookup(&self, hostname: &str) -> Result<Lookup, LookupFailure> {
        if self.servers.is_empty() {
            return Err(LookupFailure::temporary("no nameservers configured"));
        }

        let mut failures = Vec::new();
        for server in &self.servers {
            let mut addresses = Vec::new();
            let mut ttl: Option<Duration> = None;
            let mut server_failed = false;

            for query in [DnsQuery::a_query(hostname), DnsQuery::aaaa_query(hostname)] {
                match self.query(*server, query).await {
                    Ok(answer) => match answer.rcode {
                        DnsRcode::NoError => {
                            addresses.extend(answer.addresses);
                            ttl = match (ttl, answer.min_ttl) {
                                (Some(a), Some(b)) => Some(a.min(b)),
                                (a, b) => a.or(b),
                            };
                        }
                        DnsRcode::NxDomain => {
                            return Err(LookupFailure::definitive(format!(
                                "{} answered NXDOMAIN",
                                server
                            )));
                        }
                        other => {
                            failures.push(format!("{}: {:?}", server, other));
                            server_failed = true;
                            break;
                        }
                    },
                    Err(reason) => {
                        failures.push(format!("{}: {}", server, reason));
                        server_failed = true;
                        break;
                    }
                }
                // prefer IPv4; only ask for AAAA when there is no A record
                if !addresses.is_empty() {
                    break;
                }
            }

            if !addresses.is_empty() {
                return Ok(Lookup { addresses, ttl });
            }
            if !server_failed {
                return Err(LookupFailure::definitive(format!(
                    "{} returned no address records",
                    server
                )));
            }
            tracing::debug!("Nameserver {} failed for {}, trying next", server, hostname);
        }

        Err(LookupFailure::temporary(format!(
            "all nameservers failed ({})",
            failures.join("; ")
        )))
    }

    fn describe(&self) -> String {
        self.servers
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Pick the name service matching the configured DNS servers
pub fn name_service_for(config: &NetworkConfig) -> Arc<dyn NameService> {
    if config.dns_servers.is_empty() {
        Arc::new(SystemNameService)
    } else {
        Arc::new(UdpNameService::new(
            config.dns_servers.clone(),
            Duration::from_millis(config.dns_timeout_ms),
        ))
    }
}

// =============================================================================
// RESOLVER
// =============================================================================

type LookupOutcome = Result<Vec<IpAddr>, LookupFailure>;
type InFlight = Mutex<HashMap<String, watch::Receiver<Option<LookupOutcome>>>>;

enum Role {
    Leader(watch::Sender<Option<LookupOutcome>>),
    Follower(watch::Receiver<Option<LookupOutcome>>),
}

/// Removes the in-flight marker even if the leading query is dropped
struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// Caching, coalescing hostname resolver
pub struct Resolver {
    cache: DnsCache,
    service: RwLock<Arc<dyn NameService>>,
    in_flight: InFlight,
    queries: AtomicU64,
}

impl Resolver {
    pub fn new(service: Arc<dyn NameService>, config: DnsCacheConfig) -> Self {
        Self {
            cache: DnsCache::with_config(config),
            service: RwLock::new(service),
            in_flight: Mutex::new(HashMap::new()),
            queries: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    /// Swap the backing name service (e.g. after the DNS servers changed)
    pub fn set_name_service(&self, service: Arc<dyn NameService>) {
        *self.service.write() = service;
    }

    /// Servers currently answering queries
    pub fn describe_servers(&self) -> String {
        self.service.read().describe()
    }

    /// Queries issued to the name service so far
    pub fn queries_issued(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Invalidate both positive and negative caches
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Resolve a hostname, using the cache and coalescing concurrent lookups
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, FetchError> {
        let trimmed = hostname.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let key = hostname.trim_end_matches('.').to_lowercase();
        if key.is_empty() {
            return Err(FetchError::Resolution {
                host: hostname.to_string(),
                reason: "empty hostname".to_string(),
                temporary: false,
                negative_cached: false,
            });
        }

        loop {
            if let Some(entry) = self.cache.get(&key) {
                if entry.is_negative {
                    return Err(FetchError::Resolution {
                        host: key,
                        reason: entry.error.unwrap_or_else(|| "Cached DNS failure".to_string()),
                        temporary: false,
                        negative_cached: true,
                    });
                }
                return Ok(entry.addresses);
            }

            let role = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(&key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        in_flight.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            let outcome = match role {
                Role::Leader(tx) => {
                    let _guard = InFlightGuard {
                        in_flight: &self.in_flight,
                        key: key.clone(),
                    };
                    let outcome = self.query(&key).await;
                    tx.send_replace(Some(outcome.clone()));
                    outcome
                }
                Role::Follower(mut rx) => {
                    let shared = match rx.wait_for(Option::is_some).await {
                        Ok(value) => (*value).clone(),
                        // leader was dropped before answering; start over
                        Err(_) => None,
                    };
                    match shared {
                        Some(outcome) => outcome,
                        None => continue,
                    }
                }
            };

            return outcome.map_err(|failure| FetchError::Resolution {
                host: key,
                reason: failure.reason,
                temporary: failure.temporary,
                negative_cached: false,
            });
        }
    }

    async fn query(&self, key: &str) -> LookupOutcome {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let service = self.service.read().clone();
        let config = self.cache.config();

        match service.lookup(key).await {
            Ok(lookup) if !lookup.addresses.is_empty() => {
                let ttl = lookup
                    .ttl
                    .map_or(config.default_ttl, |record_ttl| record_ttl.min(config.default_ttl));
                tracing::debug!("Resolved {} -> {:?} (ttl {:?})", key, lookup.addresses, ttl);
                self.cache.insert_with_ttl(key, lookup.addresses.clone(), ttl);
                Ok(lookup.addresses)
            }
            Ok(_) => {
                let failure = LookupFailure::definitive("No addresses found");
                self.cache.insert_negative(key, failure.reason.clone());
                Err(failure)
            }
            Err(failure) if failure.temporary => {
                // left to the retry controller; not negative-cached
                tracing::debug!("Temporary DNS failure for {}: {}", key, failure.reason);
                Err(failure)
            }
            Err(failure) => {
                tracing::debug!("DNS failure for {} cached for {:?}: {}", key, config.negative_ttl, failure.reason);
                self.cache.insert_negative(key, failure.reason.clone());
                Err(failure)
            }
        }
    }

    /// Resolve several hostnames concurrently to warm the cache
    pub async fn prefetch(&self, hostnames: &[&str]) {
        use futures::future::join_all;

        let futures: Vec<_> = hostnames
            .iter()
            .map(|h| self.resolve(h))
            .collect();

        for (host, result) in hostnames.iter().zip(join_all(futures).await) {
            if let Err(e) = result {
                tracing::debug!("Prefetch of {} failed: {}", host, e);
            }
        }
    }
}
