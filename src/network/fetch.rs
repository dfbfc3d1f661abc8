//! Fetch orchestrator
//!
//! [`FetchClient`] composes the resolver, connection pool, response cache and
//! retry controller into `fetch(url, options) -> Response`. It owns the
//! shared configuration and re-configures every component whenever a new
//! snapshot is installed, whether by the user or by the network monitor.

use crate::config::{ConfigError, NetworkConfig, SharedConfig};
use crate::network::cancel::CancellationSignal;
use crate::network::connection_pool::{ConnectionKey, ConnectionPool, ConnectionPoolConfig};
use crate::network::dns_cache::{name_service_for, DnsCacheConfig, NameService, Resolver};
use crate::network::errors::{ErrorContext, FetchError};
use crate::network::http::{FetchOptions, Request, Response};
use crate::network::monitor::{ConfigSink, HttpSpeedSampler, NetworkMeasurement, NetworkMonitor};
use crate::network::response_cache::{CacheKey, ResponseCache, ResponseCacheConfig};
use crate::network::retry::{RetryController, RetryPolicy};
use crate::network::transport::{Connector, TcpConnector, TlsProvider};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// A fetch deferred until the next [`FetchClient::process_queue`]
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: Uuid,
    pub url: String,
    pub options: FetchOptions,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of one queue drain
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueReport {
    pub processed: usize,
    pub succeeded: Vec<Uuid>,
    /// Dropped entries with the reason they failed
    pub failed: Vec<(Uuid, String)>,
}

/// Builder for [`FetchClient`]
pub struct FetchClientBuilder {
    config: NetworkConfig,
    name_service: Option<Arc<dyn NameService>>,
    connector: Option<Arc<dyn Connector>>,
    tls: Option<Arc<dyn TlsProvider>>,
}

impl FetchClientBuilder {
    /// Resolve names with `service` instead of the configured servers
    pub fn name_service(mut self, service: Arc<dyn NameService>) -> Self {
        self.name_service = Some(service);
        self
    }

    /// Open connections with `connector` instead of plain TCP
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Secure connections through `provider`
    pub fn tls_provider(mut self, provider: Arc<dyn TlsProvider>) -> Self {
        self.tls = Some(provider);
        self
    }

    pub fn build(self) -> Result<FetchClient, ConfigError> {
        let config = self.config.validate()?;

        let (connector, tcp): (Arc<dyn Connector>, Option<Arc<TcpConnector>>) = match self.connector {
            Some(connector) => (connector, None),
            None => {
                let mut tcp = TcpConnector::new();
                if let Some(provider) = self.tls {
                    tcp = tcp.with_tls(provider);
                }
                tcp.set_ca_bundle(config.ca_bundle_path.clone());
                tcp.set_max_response_bytes(config.max_response_bytes);
                let tcp = Arc::new(tcp);
                let connector: Arc<dyn Connector> = tcp.clone();
                (connector, Some(tcp))
            }
        };

        let custom_name_service = self.name_service.is_some();
        let name_service = self
            .name_service
            .unwrap_or_else(|| name_service_for(&config));

        Ok(FetchClient {
            resolver: Resolver::new(name_service, DnsCacheConfig::from(&config)),
            pool: ConnectionPool::new(ConnectionPoolConfig::from(&config), connector),
            cache: ResponseCache::new(ResponseCacheConfig::from(&config)),
            retry: RetryController::new(RetryPolicy::from(&config)),
            config: SharedConfig::new(config),
            update_lock: Mutex::new(()),
            tcp,
            custom_name_service,
            queue: Mutex::new(VecDeque::new()),
            latest_measurement: RwLock::new(None),
        })
    }
}

/// Top-level entry point of the fetch pipeline
pub struct FetchClient {
    config: SharedConfig,
    /// Serializes configuration swaps with their application
    update_lock: Mutex<()>,
    resolver: Resolver,
    pool: ConnectionPool,
    cache: ResponseCache,
    retry: RetryController,
    tcp: Option<Arc<TcpConnector>>,
    custom_name_service: bool,
    queue: Mutex<VecDeque<PendingRequest>>,
    latest_measurement: RwLock<Option<NetworkMeasurement>>,
}

impl FetchClient {
    /// Client with the default transport and name service for `config`
    pub fn new(config: NetworkConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: NetworkConfig) -> FetchClientBuilder {
        FetchClientBuilder {
            config,
            name_service: None,
            connector: None,
            tls: None,
        }
    }

    /// Fetch `url`, consulting and populating the response cache as the
    /// options allow. HTTP error statuses are returned as responses.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> Result<Response, FetchError> {
        self.fetch_with_cancel(url, options, &CancellationSignal::new()).await
    }

    /// [`fetch`](Self::fetch), abandoned promptly once `cancel` fires
    pub async fn fetch_with_cancel(
        &self,
        url: &str,
        options: FetchOptions,
        cancel: &CancellationSignal,
    ) -> Result<Response, FetchError> {
        let started = Instant::now();
        let result = match Request::from_options(url, &options) {
            Ok(request) => self.execute(&request, cancel).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            let context = ErrorContext::new(e, e.stage(), url).with_duration(started.elapsed());
            tracing::warn!("{}", context);
        }
        result
    }

    /// Run a prepared request through the pipeline
    pub async fn execute(&self, request: &Request, cancel: &CancellationSignal) -> Result<Response, FetchError> {
        let config = self.config.snapshot();
        let cacheable_method = request.method().is_cacheable();
        let key = CacheKey::from_request(request, &config.cache_key);

        if request.use_cache() && cacheable_method {
            if let Some(response) = self.cache.get(&key) {
                tracing::debug!("Cache hit for {}", request.url());
                return Ok(response);
            }
        }

        let response = self
            .retry
            .execute(cancel, || self.attempt(request, &config, cancel))
            .await?;

        if request.cache_response() && cacheable_method && response.is_cacheable() {
            if self.cache.set(key, &response) {
                tracing::debug!("Cached response for {}", request.url());
            }
        }
        Ok(response)
    }

    /// One resolve + acquire + send/receive sequence. The connection goes
    /// back to the pool (or is closed) when the guard drops, on every path.
    async fn attempt(
        &self,
        request: &Request,
        config: &NetworkConfig,
        cancel: &CancellationSignal,
    ) -> Result<Response, FetchError> {
        let addresses = self.resolver.resolve(request.host()).await?;
        let ip = *addresses.first().ok_or_else(|| FetchError::Resolution {
            host: request.host().to_string(),
            reason: "No addresses found".to_string(),
            temporary: false,
            negative_cached: false,
        })?;
        let key = ConnectionKey::new(SocketAddr::new(ip, request.port()), request.is_secure());

        let mut conn = self.pool.acquire(key, request.host(), cancel).await?;
        let outcome = tokio::select! {
            result = conn.connection().send(request, &config.user_agent, config.request_timeout()) => result,
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
        };

        match outcome {
            Ok(response) => {
                tracing::debug!("{} {} -> {} via {}", request.method(), request.url(), response.status(), key);
                Ok(response)
            }
            Err(e) => {
                conn.discard();
                Err(e)
            }
        }
    }

    /// Defer a fetch; returns the entry's id
    pub fn queue_request(&self, url: &str, options: FetchOptions) -> Uuid {
        let id = Uuid::new_v4();
        self.queue.lock().push_back(PendingRequest {
            id,
            url: url.to_string(),
            options,
            enqueued_at: chrono::Utc::now(),
        });
        tracing::debug!("Queued request {} for {}", id, url);
        id
    }

    /// Number of requests waiting in the queue
    pub fn pending_requests(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drain the entries queued so far, in FIFO order, fetching each once.
    /// A failed entry is logged and dropped; entries queued while draining
    /// wait for the next pass.
    pub async fn process_queue(&self) -> QueueReport {
        let batch: Vec<PendingRequest> = self.queue.lock().drain(..).collect();
        let mut report = QueueReport::default();

        for entry in batch {
            report.processed += 1;
            match self.fetch(&entry.url, entry.options).await {
                Ok(response) => {
                    tracing::debug!("Queued request {} completed with {}", entry.id, response.status());
                    report.succeeded.push(entry.id);
                }
                Err(e) => {
                    tracing::warn!(
                        "Dropping queued request {} for {} (queued at {}): {}",
                        entry.id,
                        entry.url,
                        entry.enqueued_at.format("%H:%M:%S"),
                        e
                    );
                    report.failed.push((entry.id, e.to_string()));
                }
            }
        }
        report
    }

    /// The configuration snapshot in effect
    pub fn config(&self) -> Arc<NetworkConfig> {
        self.config.snapshot()
    }

    /// Observe configuration swaps
    pub fn subscribe_config(&self) -> tokio::sync::watch::Receiver<Arc<NetworkConfig>> {
        self.config.subscribe()
    }

    /// Validate and atomically install `config`, then re-configure every
    /// component. Fetches already running keep the snapshot they started with.
    pub fn update_config(&self, config: NetworkConfig) -> Result<(), ConfigError> {
        let config = config.validate()?;
        let _serialized = self.update_lock.lock();

        let previous = self.config.replace(config.clone());
        self.pool.reconfigure(ConnectionPoolConfig::from(&config));
        self.cache.reconfigure(ResponseCacheConfig::from(&config));
        self.resolver.cache().reconfigure(DnsCacheConfig::from(&config));
        self.retry.reconfigure(RetryPolicy::from(&config));

        if !self.custom_name_service
            && (previous.dns_servers != config.dns_servers || previous.dns_timeout_ms != config.dns_timeout_ms)
        {
            self.resolver.set_name_service(name_service_for(&config));
        }
        if let Some(tcp) = &self.tcp {
            tcp.set_ca_bundle(config.ca_bundle_path.clone());
            tcp.set_max_response_bytes(config.max_response_bytes);
        }

        tracing::info!(
            "Configuration updated: max_connections={}, per_host={}, request_timeout_ms={}, max_retries={}",
            config.max_connections,
            config.max_connections_per_host,
            config.request_timeout_ms,
            config.max_retries
        );
        Ok(())
    }

    /// Invalidate the positive and negative DNS caches
    pub fn clear_dns_cache(&self) {
        self.resolver.clear_cache();
    }

    /// Drop every cached response
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn retry(&self) -> &RetryController {
        &self.retry
    }

    /// Latest speed test pushed by the network monitor
    pub fn latest_measurement(&self) -> Option<NetworkMeasurement> {
        self.latest_measurement.read().clone()
    }

    /// Download `url` bypassing the cache, failing with `DownloadFailed` on
    /// transport errors or non-success status and with `VerificationFailed`
    /// when the body length differs from `expected_len`
    pub async fn download(&self, url: &str, expected_len: Option<usize>) -> Result<Vec<u8>, FetchError> {
        let response = self
            .fetch(url, FetchOptions::uncached())
            .await
            .map_err(|e| match e {
                FetchError::Cancelled | FetchError::InvalidUrl { .. } => e,
                other => FetchError::DownloadFailed {
                    url: url.to_string(),
                    reason: other.to_string(),
                },
            })?;

        if !response.is_success() {
            return Err(FetchError::DownloadFailed {
                url: url.to_string(),
                reason: format!("HTTP {} {}", response.status(), response.reason()),
            });
        }

        let body = response.into_body();
        if let Some(expected) = expected_len {
            if body.len() != expected {
                return Err(FetchError::VerificationFailed {
                    reason: format!("expected {} bytes from {}, received {}", expected, url, body.len()),
                });
            }
        }
        Ok(body)
    }

    /// Start the network monitor when a speed test URL is configured
    pub fn start_monitor(
        self: &Arc<Self>,
        cancel: CancellationSignal,
    ) -> Option<(Arc<NetworkMonitor>, JoinHandle<()>)> {
        let config = self.config();
        let download_url = config.speed_test_url.clone()?;

        let mut sampler = HttpSpeedSampler::new(self.clone(), download_url);
        if let Some(upload_url) = &config.upload_test_url {
            sampler = sampler.with_upload(upload_url.clone(), 256 * 1024);
        }

        let monitor = Arc::new(NetworkMonitor::new(Arc::new(sampler), self.clone()));
        let handle = monitor.clone().spawn(config.monitor_interval(), cancel);
        Some((monitor, handle))
    }

    /// Human-readable snapshot of the pipeline state; changes nothing
    pub fn generate_diagnostics_report(&self) -> String {
        let config = self.config();
        let dns = self.resolver.cache();
        let counts = self.pool.counts();
        let pool_stats = self.pool.stats();
        let cache_stats = self.cache.stats();
        let retry = self.retry.metrics();

        let mut lines = vec![
            "=== Network Diagnostics ===".to_string(),
            format!("Generated: {}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")),
            String::new(),
            format!("DNS servers: {}", self.resolver.describe_servers()),
            format!(
                "DNS cache: {} entries, {} negative (max {}), hit rate {:.1}%, {} queries issued",
                dns.size(),
                dns.negative_size(),
                dns.config().max_entries,
                dns.stats().hit_rate() * 100.0,
                self.resolver.queries_issued()
            ),
            format!(
                "Response cache: {} entries, {} / {} bytes ({} policy), hit rate {:.1}%",
                self.cache.len(),
                self.cache.total_bytes(),
                config.cache_max_bytes,
                config.cache_policy,
                cache_stats.hit_rate() * 100.0
            ),
            format!(
                "Connections: {} active, {} idle, {} open (max {}, {} per host)",
                counts.busy, counts.idle, counts.open, config.max_connections, config.max_connections_per_host
            ),
            format!(
                "Connection reuse: {} created, {} reused, peak {} busy, {} acquire timeouts",
                pool_stats.connections_created.load(Ordering::Relaxed),
                pool_stats.connections_reused.load(Ordering::Relaxed),
                pool_stats.peak_busy.load(Ordering::Relaxed),
                pool_stats.acquire_timeouts.load(Ordering::Relaxed)
            ),
            format!(
                "Retries: {} operations, {} retries, {} recovered, {} exhausted (max {} attempts)",
                retry.total_operations.load(Ordering::Relaxed),
                retry.total_retry_attempts.load(Ordering::Relaxed),
                retry.retry_success.load(Ordering::Relaxed),
                retry.retry_exhausted.load(Ordering::Relaxed),
                config.max_retries
            ),
            format!("Request timeout: {:?}", config.request_timeout()),
        ];

        lines.push(match self.latest_measurement() {
            Some(measurement) => format!("Speed test: {}", measurement),
            None => "Speed test: no measurement yet".to_string(),
        });
        lines.push(format!("Pending requests: {}", self.pending_requests()));

        lines.join("\n")
    }
}

impl ConfigSink for FetchClient {
    fn current_config(&self) -> Arc<NetworkConfig> {
        self.config()
    }

    fn push_config(&self, config: NetworkConfig) -> Result<(), ConfigError> {
        self.update_config(config)
    }

    fn record_measurement(&self, measurement: &NetworkMeasurement) {
        *self.latest_measurement.write() = Some(measurement.clone());
    }
}
