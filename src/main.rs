//! netfetch - fetch URLs through a caching, pooling, retrying pipeline
//!
//! Features:
//! - DNS caching with negative entries and coalesced lookups
//! - Connection pooling with per-host and global limits
//! - Response caching with LRU or age-based eviction
//! - Exponential backoff retry for transient failures
//! - Bandwidth monitoring that retunes limits and timeouts

use anyhow::{Context, Result};
use clap::Parser;
use netfetch::config::NetworkConfig;
use netfetch::logging;
use netfetch::network::{CancellationSignal, FetchClient, FetchOptions};
use netfetch::Args;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let _log_guard = logging::init_logging(&args)?;

    tracing::info!("Starting netfetch v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Debug mode: {}", args.debug);

    let config = match &args.config {
        Some(path) => NetworkConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => NetworkConfig::default(),
    };
    let config = args.apply_overrides(config);
    let client = Arc::new(FetchClient::new(config).context("invalid configuration")?);

    let shutdown = CancellationSignal::new();
    let monitor = client.start_monitor(shutdown.clone());

    let options = if args.no_cache {
        FetchOptions::uncached()
    } else {
        FetchOptions::new()
    };

    let mut exit_code = 0;
    if args.queue {
        for url in &args.urls {
            client.queue_request(url, options.clone());
        }
        let report = client.process_queue().await;
        println!(
            "Processed {} queued requests: {} succeeded, {} failed",
            report.processed,
            report.succeeded.len(),
            report.failed.len()
        );
        if !report.failed.is_empty() {
            exit_code = 1;
        }
    } else {
        for url in &args.urls {
            match client.fetch_with_cancel(url, options.clone(), &shutdown).await {
                Ok(response) => {
                    println!("{} {} ({} bytes) {}", response.status(), response.reason(), response.body().len(), url);
                }
                Err(e) => {
                    eprintln!("error: {}", e);
                    eprintln!("hint: {}", e.suggestion());
                    exit_code = e.code();
                }
            }
        }
    }

    if args.diagnostics {
        println!("{}", client.generate_diagnostics_report());
    }

    shutdown.cancel();
    if let Some((_, handle)) = monitor {
        if let Err(e) = handle.await {
            tracing::error!("Network monitor task failed: {}", e);
        }
    }

    tracing::info!("netfetch shutdown complete");
    Ok(ExitCode::from(exit_status(exit_code)))
}

/// Process status for an error code; codes outside 0..=255 become 1
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status_keeps_error_codes() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(6), 6);
        assert_eq!(exit_status(89), 89);
        assert_eq!(exit_status(-1), 1);
        assert_eq!(exit_status(300), 1);
    }
}
