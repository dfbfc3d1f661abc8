//! Network fetch pipeline
//!
//! A fetch flows through these stages:
//! - Name resolution with positive/negative DNS caching and coalescing of
//!   concurrent lookups (`dns_cache`)
//! - Connection pooling with per-host and global ceilings (`connection_pool`)
//! - HTTP/1.1 exchange over plain or TLS transport (`transport`, `http`)
//! - Response caching keyed by normalized request identity (`response_cache`)
//! - Retry with exponential backoff around the whole attempt (`retry`)
//!
//! `monitor` measures bandwidth periodically and retunes the configuration;
//! `fetch` ties the stages together.

pub mod cancel;
pub mod connection_pool;
pub mod dns_cache;
pub mod errors;
pub mod fetch;
pub mod http;
pub mod monitor;
pub mod protocols;
pub mod response_cache;
pub mod retry;
pub mod transport;

// Re-export commonly used types
pub use cancel::CancellationSignal;
pub use connection_pool::{ConnectionKey, ConnectionPool, ConnectionPoolConfig, PoolCounts, PoolStats};
pub use dns_cache::{DnsCache, DnsCacheConfig, Lookup, LookupFailure, NameService, Resolver};
pub use errors::{ErrorCategory, ErrorContext, FetchError, Stage};
pub use fetch::{FetchClient, FetchClientBuilder, QueueReport};
pub use http::{FetchOptions, Method, Request, Response};
pub use monitor::{BandwidthBand, NetworkMeasurement, NetworkMonitor, SpeedSampler};
pub use response_cache::{CacheKey, ResponseCache};
pub use retry::{BackoffStrategy, RetryController, RetryPolicy};
pub use transport::{Connection, Connector, TcpConnector, TlsProvider};
