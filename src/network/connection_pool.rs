//! Connection pooling with hard ceilings, TTL and LRU eviction
//!
//! Connections are keyed by (address, secure). The pool never holds more
//! than `max_total` open connections, nor more than `max_per_host` for one
//! key; an acquisition that would exceed either ceiling waits for a release
//! instead, up to the configured acquire timeout.

use crate::config::NetworkConfig;
use crate::network::cancel::CancellationSignal;
use crate::network::errors::FetchError;
use crate::network::transport::{Connection, Connector};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Configuration for connection pooling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPoolConfig {
    /// Maximum connections per host
    pub max_per_host: usize,
    /// Maximum total connections, idle and busy
    pub max_total: usize,
    /// Time-to-live for idle connections
    pub idle_timeout: Duration,
    /// Maximum age of a connection (even if active)
    pub max_connection_age: Duration,
    /// How long an acquisition waits for a free slot
    pub acquire_timeout: Duration,
    /// Timeout for establishing a new connection
    pub connect_timeout: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for ConnectionPoolConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            max_per_host: config.max_connections_per_host.min(config.max_connections),
            max_total: config.max_connections,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            max_connection_age: Duration::from_secs(config.max_connection_age_secs),
            acquire_timeout: config.pool_acquire_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Key for identifying poolable connections
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct ConnectionKey {
    /// Remote address (IP and port)
    pub addr: SocketAddr,
    /// Whether this is a TLS connection
    pub is_tls: bool,
}

impl ConnectionKey {
    pub fn new(addr: SocketAddr, is_tls: bool) -> Self {
        Self { addr, is_tls }
    }

    pub fn from_addr(addr: SocketAddr) -> Self {
        Self { addr, is_tls: false }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.is_tls { "tls" } else { "tcp" };
        write!(f, "{}://{}", scheme, self.addr)
    }
}

/// A pooled connection with metadata
pub struct PooledConnection {
    conn: Box<dyn Connection>,
    /// When this connection was created
    pub created_at: Instant,
    /// When this connection was last used
    pub last_used: Instant,
    /// Number of times this connection has been reused
    pub reuse_count: u32,
    /// Connection key for returning to pool
    pub key: ConnectionKey,
}

impl PooledConnection {
    /// Create a new pooled connection
    pub fn new(conn: Box<dyn Connection>, key: ConnectionKey) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
            reuse_count: 0,
            key,
        }
    }

    /// Check if this connection has exceeded its idle timeout
    pub fn is_idle_expired(&self, timeout: Duration) -> bool {
        self.last_used.elapsed() > timeout
    }

    /// Check if this connection has exceeded its maximum age
    pub fn is_age_expired(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }

    /// Check if the connection is still valid (not closed by peer)
    pub fn is_valid(&self) -> bool {
        self.conn.is_open()
    }

    /// Mark this connection as reused
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
        self.reuse_count += 1;
    }
}

/// Connection pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total connections created
    pub connections_created: AtomicU64,
    /// Total connections reused from pool
    pub connections_reused: AtomicU64,
    /// Total connections that expired (TTL or closed by peer)
    pub connections_expired: AtomicU64,
    /// Total idle connections evicted to make room (LRU)
    pub connections_evicted: AtomicU64,
    /// Acquisitions that gave up waiting
    pub acquire_timeouts: AtomicU64,
    /// Highest number of simultaneously busy connections
    pub peak_busy: AtomicU64,
}

impl PoolStats {
    /// Calculate the hit rate (reused / (reused + created))
    pub fn hit_rate(&self) -> f64 {
        let reused = self.connections_reused.load(Ordering::Relaxed);
        let created = self.connections_created.load(Ordering::Relaxed);
        let total = reused + created;
        if total == 0 {
            0.0
        } else {
            reused as f64 / total as f64
        }
    }
}

/// Point-in-time connection counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolCounts {
    pub idle: usize,
    pub busy: usize,
    /// Idle + busy + connecting
    pub open: usize,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<ConnectionKey, VecDeque<PooledConnection>>,
    open_per_key: HashMap<ConnectionKey, usize>,
    total_open: usize,
    busy: usize,
}

impl PoolState {
    fn open_for(&self, key: &ConnectionKey) -> usize {
        self.open_per_key.get(key).copied().unwrap_or(0)
    }

    fn idle_count(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }

    fn reserve(&mut self, key: ConnectionKey) {
        *self.open_per_key.entry(key).or_insert(0) += 1;
        self.total_open += 1;
    }

    /// Forget an open connection (or a reserved slot) for `key`
    fn close(&mut self, key: &ConnectionKey) {
        if let Some(count) = self.open_per_key.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.open_per_key.remove(key);
            }
        }
        self.total_open = self.total_open.saturating_sub(1);
    }
}

enum Step<'a> {
    Reuse(PooledConnection),
    Create,
    Wait(Pin<Box<Notified<'a>>>),
}

/// Connection pool with blocking, bounded acquisition
pub struct ConnectionPool {
    state: Mutex<PoolState>,
    config: RwLock<ConnectionPoolConfig>,
    connector: Arc<dyn Connector>,
    released: Notify,
    stats: PoolStats,
}

impl ConnectionPool {
    /// Create a new connection pool with custom configuration
    pub fn new(config: ConnectionPoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            config: RwLock::new(config),
            connector,
            released: Notify::new(),
            stats: PoolStats::default(),
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn config(&self) -> ConnectionPoolConfig {
        self.config.read().clone()
    }

    pub fn counts(&self) -> PoolCounts {
        let state = self.state.lock();
        PoolCounts {
            idle: state.idle_count(),
            busy: state.busy,
            open: state.total_open,
        }
    }

    /// Check out a connection for `key`, reusing an idle one when possible.
    ///
    /// `host` is the name the connection is made for (TLS server name).
    pub async fn acquire(
        &self,
        key: ConnectionKey,
        host: &str,
        cancel: &CancellationSignal,
    ) -> Result<ConnectionGuard<'_>, FetchError> {
        let config = self.config();
        let started = Instant::now();
        let deadline = started + config.acquire_timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let step = {
                let mut state = self.state.lock();
                self.plan(&mut state, key)
            };

            match step {
                Step::Reuse(conn) => {
                    tracing::debug!("Reusing connection to {} (reuse #{})", key, conn.reuse_count);
                    return Ok(ConnectionGuard::new(conn, self));
                }
                Step::Create => {
                    let slot = SlotReservation {
                        pool: self,
                        key,
                        committed: false,
                    };
                    let conn = tokio::select! {
                        result = self.connector.connect(&key, host, config.connect_timeout) => result?,
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    };
                    slot.commit();
                    self.stats.connections_created.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Opened new connection to {}", key);
                    return Ok(ConnectionGuard::new(PooledConnection::new(conn, key), self));
                }
                Step::Wait(notified) => {
                    tokio::select! {
                        _ = notified => continue,
                        _ = tokio::time::sleep_until(deadline) => {
                            self.stats.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                            let busy = self.state.lock().busy;
                            return Err(FetchError::PoolExhausted {
                                key: key.to_string(),
                                waited: started.elapsed(),
                                busy,
                                max_total: self.config.read().max_total,
                            });
                        }
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    }
                }
            }
        }
    }

    /// Decide how to satisfy an acquisition; runs under the state lock
    fn plan(&self, state: &mut PoolState, key: ConnectionKey) -> Step<'_> {
        let config = self.config.read().clone();
        self.evict_stale(state, &config);

        if let Some(queue) = state.idle.get_mut(&key) {
            // most recently used first
            if let Some(mut conn) = queue.pop_back() {
                if queue.is_empty() {
                    state.idle.remove(&key);
                }
                conn.touch();
                self.mark_busy(state);
                self.stats.connections_reused.fetch_add(1, Ordering::Relaxed);
                return Step::Reuse(conn);
            }
        }

        if state.open_for(&key) < config.max_per_host
            && (state.total_open < config.max_total || self.evict_one_lru(state, Some(&key)))
        {
            state.reserve(key);
            self.mark_busy(state);
            return Step::Create;
        }

        let mut notified = Box::pin(self.released.notified());
        // registered before the lock is dropped, so no release is missed
        notified.as_mut().enable();
        Step::Wait(notified)
    }

    fn mark_busy(&self, state: &mut PoolState) {
        state.busy += 1;
        self.stats.peak_busy.fetch_max(state.busy as u64, Ordering::Relaxed);
    }

    /// Close idle connections that timed out, aged out or were closed by the peer
    fn evict_stale(&self, state: &mut PoolState, config: &ConnectionPoolConfig) {
        let mut closed = Vec::new();
        state.idle.retain(|key, queue| {
            queue.retain(|conn| {
                let keep = !conn.is_idle_expired(config.idle_timeout)
                    && !conn.is_age_expired(config.max_connection_age)
                    && conn.is_valid();
                if !keep {
                    closed.push(*key);
                }
                keep
            });
            !queue.is_empty()
        });

        for key in &closed {
            state.close(key);
        }
        if !closed.is_empty() {
            self.stats
                .connections_expired
                .fetch_add(closed.len() as u64, Ordering::Relaxed);
            tracing::debug!("Closed {} stale idle connections", closed.len());
        }
    }

    /// Evict the least recently used idle connection, skipping `exclude`
    fn evict_one_lru(&self, state: &mut PoolState, exclude: Option<&ConnectionKey>) -> bool {
        let oldest_key = state
            .idle
            .iter()
            .filter(|(key, _)| Some(*key) != exclude)
            .filter_map(|(key, queue)| queue.front().map(|conn| (*key, conn.last_used)))
            .min_by_key(|(_, last_used)| *last_used)
            .map(|(key, _)| key);

        let Some(key) = oldest_key else {
            return false;
        };

        if let Some(queue) = state.idle.get_mut(&key) {
            queue.pop_front();
            if queue.is_empty() {
                state.idle.remove(&key);
            }
        }
        state.close(&key);
        self.stats.connections_evicted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Evicted idle connection to {}", key);
        true
    }

    /// Return a checked-out connection, or close it when `discard` is set or
    /// it can no longer be reused
    fn release(&self, mut conn: PooledConnection, discard: bool) {
        let config = self.config.read().clone();
        {
            let mut state = self.state.lock();
            state.busy = state.busy.saturating_sub(1);

            let over_ceiling = state.total_open > config.max_total
                || state.open_for(&conn.key) > config.max_per_host;
            let keep = !discard
                && !over_ceiling
                && conn.is_valid()
                && !conn.is_age_expired(config.max_connection_age);

            if keep {
                conn.last_used = Instant::now();
                state.idle.entry(conn.key).or_default().push_back(conn);
            } else {
                state.close(&conn.key);
                tracing::debug!("Closed connection to {}", conn.key);
            }
        }
        self.released.notify_waiters();
    }

    /// Give back a reserved slot whose connection was never established
    fn cancel_slot(&self, key: &ConnectionKey) {
        {
            let mut state = self.state.lock();
            state.busy = state.busy.saturating_sub(1);
            state.close(key);
        }
        self.released.notify_waiters();
    }

    /// Change the global ceiling, closing excess idle connections (LRU
    /// first). Busy connections are never closed; they are dropped on
    /// release until the pool is back under the ceiling.
    pub fn set_max_connections(&self, max_total: usize) {
        let mut config = self.config();
        config.max_total = max_total.max(1);
        config.max_per_host = config.max_per_host.min(config.max_total);
        self.reconfigure(config);
    }

    /// Replace the whole configuration and apply it immediately
    pub fn reconfigure(&self, config: ConnectionPoolConfig) {
        let max_total = config.max_total;
        *self.config.write() = config;
        {
            let mut state = self.state.lock();
            while state.total_open > max_total {
                if !self.evict_one_lru(&mut state, None) {
                    break;
                }
            }
        }
        // a larger ceiling may unblock waiters
        self.released.notify_waiters();
    }

    /// Clean up expired connections
    pub fn cleanup(&self) {
        let config = self.config();
        let mut state = self.state.lock();
        self.evict_stale(&mut state, &config);
    }

    /// Number of idle pooled connections
    pub fn size(&self) -> usize {
        self.state.lock().idle_count()
    }

    /// Close every idle connection
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let drained: Vec<ConnectionKey> = state
            .idle
            .drain()
            .flat_map(|(key, queue)| std::iter::repeat(key).take(queue.len()))
            .collect();
        for key in &drained {
            state.close(key);
        }
    }
}

/// Reserved capacity for a connection being established; released again if
/// the connect fails or the acquisition is dropped
struct SlotReservation<'a> {
    pool: &'a ConnectionPool,
    key: ConnectionKey,
    committed: bool,
}

impl SlotReservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.cancel_slot(&self.key);
        }
    }
}

/// RAII guard for pooled connections - automatically returns to pool on drop
pub struct ConnectionGuard<'a> {
    conn: Option<PooledConnection>,
    pool: &'a ConnectionPool,
    discard: bool,
}

impl<'a> ConnectionGuard<'a> {
    fn new(conn: PooledConnection, pool: &'a ConnectionPool) -> Self {
        Self {
            conn: Some(conn),
            pool,
            discard: false,
        }
    }

    fn pooled(&self) -> &PooledConnection {
        self.conn.as_ref().expect("connection present until drop")
    }

    pub fn key(&self) -> ConnectionKey {
        self.pooled().key
    }

    /// Times this connection was handed out again after its first use
    pub fn reuse_count(&self) -> u32 {
        self.pooled().reuse_count
    }

    /// Get a mutable reference to the underlying connection
    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn
            .as_mut()
            .expect("connection present until drop")
            .conn
            .as_mut()
    }

    /// Don't return this connection to the pool (e.g., if an error occurred)
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.discard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::http::{Headers, Request, Response};
    use async_trait::async_trait;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct MockConnection {
        open: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn send(&mut self, _: &Request, _: &str, _: Duration) -> Result<Response, FetchError> {
            Ok(Response::new(200, "OK", Headers::new(), Vec::new()))
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct MockConnector {
        connects: AtomicUsize,
        last_open: Mutex<Option<Arc<AtomicBool>>>,
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            _: &ConnectionKey,
            _: &str,
            _: Duration,
        ) -> Result<Box<dyn Connection>, FetchError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let open = Arc::new(AtomicBool::new(true));
            *self.last_open.lock() = Some(open.clone());
            Ok(Box::new(MockConnection { open }))
        }
    }

    fn make_key(port: u16) -> ConnectionKey {
        ConnectionKey::from_addr(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(127, 0, 0, 1),
            port,
        )))
    }

    fn pool(max_total: usize, max_per_host: usize) -> (ConnectionPool, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::default());
        let config = ConnectionPoolConfig {
            max_total,
            max_per_host,
            acquire_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        (ConnectionPool::new(config, connector.clone()), connector)
    }

    #[test]
    fn test_connection_pool_config_from_network_config() {
        let config = ConnectionPoolConfig::from(&NetworkConfig {
            max_connections: 4,
            max_connections_per_host: 10,
            ..Default::default()
        });
        assert_eq!(config.max_total, 4);
        assert_eq!(config.max_per_host, 4);
    }

    #[test]
    fn test_connection_key_display() {
        assert_eq!(format!("{}", make_key(8080)), "tcp://127.0.0.1:8080");
    }

    #[test]
    fn test_pool_stats_hit_rate() {
        let stats = PoolStats::default();
        assert_eq!(stats.hit_rate(), 0.0);

        stats.connections_reused.store(3, Ordering::Relaxed);
        stats.connections_created.store(7, Ordering::Relaxed);
        assert!((stats.hit_rate() - 0.3).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let (pool, connector) = pool(4, 2);
        let cancel = CancellationSignal::new();

        drop(pool.acquire(make_key(80), "a", &cancel).await.unwrap());
        assert_eq!(pool.size(), 1);

        let guard = pool.acquire(make_key(80), "a", &cancel).await.unwrap();
        assert_eq!(guard.reuse_count(), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.counts(), PoolCounts { idle: 0, busy: 1, open: 1 });
    }

    #[tokio::test]
    async fn test_discard_closes_connection() {
        let (pool, _) = pool(4, 2);
        let cancel = CancellationSignal::new();

        pool.acquire(make_key(80), "a", &cancel).await.unwrap().discard();
        assert_eq!(pool.counts(), PoolCounts::default());
    }

    #[tokio::test]
    async fn test_peer_closed_connection_not_reused() {
        let (pool, connector) = pool(4, 2);
        let cancel = CancellationSignal::new();

        drop(pool.acquire(make_key(80), "a", &cancel).await.unwrap());
        if let Some(open) = connector.last_open.lock().as_ref() {
            open.store(false, Ordering::SeqCst);
        }

        let guard = pool.acquire(make_key(80), "a", &cancel).await.unwrap();
        assert_eq!(guard.reuse_count(), 0);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().connections_expired.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_evicts_lazily() {
        let (pool, connector) = pool(4, 2);
        let cancel = CancellationSignal::new();

        drop(pool.acquire(make_key(80), "a", &cancel).await.unwrap());
        tokio::time::advance(pool.config().idle_timeout + Duration::from_secs(1)).await;

        // still counted until the next acquisition scans the pool
        assert_eq!(pool.size(), 1);
        let _guard = pool.acquire(make_key(80), "a", &cancel).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.counts().open, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_at_ceiling() {
        let (pool, _) = pool(1, 1);
        let cancel = CancellationSignal::new();

        let _held = pool.acquire(make_key(80), "a", &cancel).await.unwrap();
        let err = pool.acquire(make_key(80), "a", &cancel).await.err().unwrap();

        assert!(matches!(err, FetchError::PoolExhausted { busy: 1, max_total: 1, .. }));
        assert_eq!(pool.stats().acquire_timeouts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let (pool, connector) = pool(1, 1);
        let pool = Arc::new(pool);
        let cancel = CancellationSignal::new();

        let held = pool.acquire(make_key(80), "a", &cancel).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let guard = pool.acquire(make_key(80), "a", &cancel).await?;
                Ok::<u32, FetchError>(guard.reuse_count())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_host_ceiling_blocks_only_that_host() {
        let (pool, _) = pool(4, 1);
        let cancel = CancellationSignal::new();

        let _a = pool.acquire(make_key(80), "a", &cancel).await.unwrap();
        // another destination is unaffected
        let _b = pool.acquire(make_key(81), "b", &cancel).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            pool.acquire(make_key(80), "a", &cancel),
        )
        .await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_global_ceiling_evicts_other_hosts_idle() {
        let (pool, connector) = pool(1, 1);
        let cancel = CancellationSignal::new();

        drop(pool.acquire(make_key(80), "a", &cancel).await.unwrap());
        let _b = pool.acquire(make_key(81), "b", &cancel).await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().connections_evicted.load(Ordering::Relaxed), 1);
        assert_eq!(pool.counts(), PoolCounts { idle: 0, busy: 1, open: 1 });
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let (pool, _) = pool(1, 1);
        let pool = Arc::new(pool);
        let cancel = CancellationSignal::new();

        let _held = pool.acquire(make_key(80), "a", &cancel).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(make_key(80), "a", &cancel).await.err() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert!(matches!(waiter.await.unwrap(), Some(FetchError::Cancelled)));
    }

    #[tokio::test]
    async fn test_set_max_connections_closes_idle_only() {
        let (pool, _) = pool(4, 4);
        let cancel = CancellationSignal::new();

        let busy = pool.acquire(make_key(80), "a", &cancel).await.unwrap();
        let idle1 = pool.acquire(make_key(81), "b", &cancel).await.unwrap();
        let idle2 = pool.acquire(make_key(82), "c", &cancel).await.unwrap();
        drop(idle1);
        drop(idle2);
        assert_eq!(pool.counts().open, 3);

        pool.set_max_connections(1);
        assert_eq!(pool.counts(), PoolCounts { idle: 0, busy: 1, open: 1 });

        drop(busy);
        assert_eq!(pool.counts().idle, 1);
        assert_eq!(pool.config().max_per_host, 1);
    }

    #[tokio::test]
    async fn test_release_over_lowered_ceiling_closes() {
        let (pool, _) = pool(4, 4);
        let cancel = CancellationSignal::new();

        let a = pool.acquire(make_key(80), "a", &cancel).await.unwrap();
        let b = pool.acquire(make_key(80), "a", &cancel).await.unwrap();
        pool.set_max_connections(1);
        assert_eq!(pool.counts().open, 2);

        drop(a);
        assert_eq!(pool.counts().open, 1);
        drop(b);
        assert_eq!(pool.counts(), PoolCounts { idle: 1, busy: 0, open: 1 });
    }

    #[tokio::test]
    async fn test_peak_busy_tracked() {
        let (pool, _) = pool(4, 4);
        let cancel = CancellationSignal::new();

        let a = pool.acquire(make_key(80), "a", &cancel).await.unwrap();
        let b = pool.acquire(make_key(80), "a", &cancel).await.unwrap();
        drop((a, b));
        let _c = pool.acquire(make_key(80), "a", &cancel).await.unwrap();

        assert_eq!(pool.stats().peak_busy.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_releases_slot() {
        struct Refusing;

        #[async_trait]
        impl Connector for Refusing {
            async fn connect(
                &self,
                key: &ConnectionKey,
                _: &str,
                _: Duration,
            ) -> Result<Box<dyn Connection>, FetchError> {
                Err(FetchError::ConnectionRefused { addr: key.addr })
            }
        }

        let pool = ConnectionPool::new(
            ConnectionPoolConfig {
                max_total: 1,
                max_per_host: 1,
                ..Default::default()
            },
            Arc::new(Refusing),
        );
        let cancel = CancellationSignal::new();

        for _ in 0..3 {
            let err = pool.acquire(make_key(80), "a", &cancel).await.err().unwrap();
            assert!(matches!(err, FetchError::ConnectionRefused { .. }));
        }
        assert_eq!(pool.counts(), PoolCounts::default());
    }

    #[tokio::test]
    async fn test_clear_and_cleanup() {
        let (pool, _) = pool(4, 4);
        let cancel = CancellationSignal::new();

        drop(pool.acquire(make_key(80), "a", &cancel).await.unwrap());
        pool.cleanup();
        assert_eq!(pool.size(), 1);

        pool.clear();
        assert_eq!(pool.counts(), PoolCounts::default());
    }
}
