//! netfetch library
//!
//! A network fetch pipeline: DNS caching, connection pooling, response
//! caching, retry with backoff and bandwidth-adaptive configuration.
//! The binary is a thin CLI over [`network::FetchClient`].

pub mod cli;
pub mod config;
pub mod logging;
pub mod network;

// Re-export Args for convenience
pub use cli::Args;
pub use config::NetworkConfig;
pub use network::{FetchClient, FetchError, FetchOptions};
