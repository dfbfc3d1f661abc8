//! Network condition monitor
//!
//! Periodically measures throughput and latency, classifies the result into
//! a [`BandwidthBand`] and pushes the band's pool/timeout settings as a new
//! configuration snapshot.

use crate::config::{ConfigError, NetworkConfig};
use crate::network::cancel::CancellationSignal;
use crate::network::errors::FetchError;
use crate::network::fetch::FetchClient;
use crate::network::http::{FetchOptions, Method};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Result of one speed test
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkMeasurement {
    /// Download throughput in bits per second
    pub download_bps: f64,
    /// Upload throughput in bits per second (0 when not measured)
    pub upload_bps: f64,
    pub latency: Duration,
    pub measured_at: chrono::DateTime<chrono::Utc>,
}

impl fmt::Display for NetworkMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "down {:.2} Mbps, up {:.2} Mbps, latency {:?} (at {})",
            self.download_bps / 1_000_000.0,
            self.upload_bps / 1_000_000.0,
            self.latency,
            self.measured_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Download bandwidth classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthBand {
    /// Below 1 Mbps
    Low,
    /// 1 to 10 Mbps
    Medium,
    /// Above 10 Mbps
    High,
}

impl BandwidthBand {
    pub fn classify(download_bps: f64) -> Self {
        if download_bps < 1_000_000.0 {
            BandwidthBand::Low
        } else if download_bps <= 10_000_000.0 {
            BandwidthBand::Medium
        } else {
            BandwidthBand::High
        }
    }

    /// Per-host connection ceiling prescribed for this band
    pub fn max_connections_per_host(&self) -> usize {
        match self {
            BandwidthBand::Low => 2,
            BandwidthBand::Medium => 4,
            BandwidthBand::High => 8,
        }
    }

    /// Request timeout prescribed for this band, in milliseconds
    pub fn request_timeout_ms(&self) -> u64 {
        match self {
            BandwidthBand::Low => 30_000,
            BandwidthBand::Medium => 15_000,
            BandwidthBand::High => 10_000,
        }
    }

    /// `config` with this band's settings; the per-host ceiling never
    /// exceeds the global one
    pub fn apply(&self, config: &NetworkConfig) -> NetworkConfig {
        NetworkConfig {
            max_connections_per_host: self.max_connections_per_host().min(config.max_connections),
            request_timeout_ms: self.request_timeout_ms(),
            ..config.clone()
        }
    }
}

impl fmt::Display for BandwidthBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BandwidthBand::Low => write!(f, "low"),
            BandwidthBand::Medium => write!(f, "medium"),
            BandwidthBand::High => write!(f, "high"),
        }
    }
}

/// Source of speed measurements
#[async_trait]
pub trait SpeedSampler: Send + Sync {
    async fn measure(&self) -> Result<NetworkMeasurement, FetchError>;
}

/// Receiver of monitor-derived configuration
pub trait ConfigSink: Send + Sync {
    /// The configuration currently in effect
    fn current_config(&self) -> Arc<NetworkConfig>;

    /// Atomically replace the configuration
    fn push_config(&self, config: NetworkConfig) -> Result<(), ConfigError>;

    /// Called with every completed measurement
    fn record_measurement(&self, _measurement: &NetworkMeasurement) {}
}

/// Clears the in-progress flag when a measurement ends, however it ends
struct MeasuringGuard<'a>(&'a AtomicBool);

impl Drop for MeasuringGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic, non-reentrant network measurement
pub struct NetworkMonitor {
    sampler: Arc<dyn SpeedSampler>,
    sink: Arc<dyn ConfigSink>,
    measuring: AtomicBool,
    latest: RwLock<Option<NetworkMeasurement>>,
}

impl NetworkMonitor {
    pub fn new(sampler: Arc<dyn SpeedSampler>, sink: Arc<dyn ConfigSink>) -> Self {
        Self {
            sampler,
            sink,
            measuring: AtomicBool::new(false),
            latest: RwLock::new(None),
        }
    }

    /// Most recent successful measurement
    pub fn latest(&self) -> Option<NetworkMeasurement> {
        self.latest.read().clone()
    }

    /// Run one measurement and push the resulting configuration.
    ///
    /// Returns `Ok(None)` without measuring when another measurement is
    /// still in progress.
    pub async fn measure(&self) -> Result<Option<NetworkMeasurement>, FetchError> {
        if self
            .measuring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Measurement already in progress, skipping");
            return Ok(None);
        }
        let _guard = MeasuringGuard(&self.measuring);

        let measurement = self.sampler.measure().await?;
        *self.latest.write() = Some(measurement.clone());
        self.sink.record_measurement(&measurement);

        let band = BandwidthBand::classify(measurement.download_bps);
        let current = self.sink.current_config();
        let updated = band.apply(&current);
        if updated != *current {
            tracing::info!(
                "Network band {} ({}): max_connections_per_host={}, request_timeout_ms={}",
                band,
                measurement,
                updated.max_connections_per_host,
                updated.request_timeout_ms
            );
            if let Err(e) = self.sink.push_config(updated) {
                tracing::warn!("Rejected monitor configuration: {}", e);
            }
        }

        Ok(Some(measurement))
    }

    /// Measure every `interval` until `cancel` fires
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.measure().await {
                            tracing::warn!("Network measurement failed: {}", e);
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::debug!("Network monitor stopped");
        })
    }
}

/// Speed sampler fetching through the pipeline with caching disabled
pub struct HttpSpeedSampler {
    client: Arc<FetchClient>,
    download_url: String,
    upload_url: Option<String>,
    upload_bytes: usize,
}

impl HttpSpeedSampler {
    pub fn new(client: Arc<FetchClient>, download_url: impl Into<String>) -> Self {
        Self {
            client,
            download_url: download_url.into(),
            upload_url: None,
            upload_bytes: 256 * 1024,
        }
    }

    pub fn with_upload(mut self, url: impl Into<String>, bytes: usize) -> Self {
        self.upload_url = Some(url.into());
        self.upload_bytes = bytes;
        self
    }

    fn bits_per_second(bytes: usize, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64().max(1e-6);
        bytes as f64 * 8.0 / secs
    }
}

#[async_trait]
impl SpeedSampler for HttpSpeedSampler {
    async fn measure(&self) -> Result<NetworkMeasurement, FetchError> {
        let started = Instant::now();
        self.client
            .fetch(&self.download_url, FetchOptions::uncached().method(Method::Head))
            .await?;
        let latency = started.elapsed();

        let started = Instant::now();
        let response = self
            .client
            .fetch(&self.download_url, FetchOptions::uncached())
            .await?
            .error_for_status(&self.download_url)?;
        let download_bps = Self::bits_per_second(response.body().len(), started.elapsed());

        let upload_bps = match &self.upload_url {
            Some(url) => {
                let started = Instant::now();
                self.client
                    .fetch(
                        url,
                        FetchOptions::uncached()
                            .method(Method::Post)
                            .body(vec![0u8; self.upload_bytes]),
                    )
                    .await?
                    .error_for_status(url)?;
                Self::bits_per_second(self.upload_bytes, started.elapsed())
            }
            None => 0.0,
        };

        Ok(NetworkMeasurement {
            download_bps,
            upload_bps,
            latency,
            measured_at: chrono::Utc::now(),
        })
    }
}
