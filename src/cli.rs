//! Command-line argument parsing for netfetch

use crate::config::NetworkConfig;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "netfetch")]
#[command(author = "netfetch contributors")]
#[command(version)]
#[command(about = "Fetch URLs through a caching, pooling, retrying network pipeline", long_about = None)]
pub struct Args {
    /// URLs to fetch, in order
    pub urls: Vec<String>,

    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    pub debug: bool,

    /// Log file path
    #[arg(short, long, default_value = "netfetch.log")]
    pub log_file: PathBuf,

    /// Bypass the response cache for these fetches
    #[arg(long, default_value_t = false)]
    pub no_cache: bool,

    /// Queue the URLs and process them as one batch
    #[arg(short, long, default_value_t = false)]
    pub queue: bool,

    /// Print the diagnostics report after fetching
    #[arg(long, default_value_t = false)]
    pub diagnostics: bool,

    /// Request timeout in milliseconds (overrides the config file)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Total attempts per fetch (overrides the config file)
    #[arg(short = 'r', long)]
    pub max_retries: Option<u32>,
}

impl Args {
    /// Apply command-line overrides on top of a loaded configuration
    pub fn apply_overrides(&self, mut config: NetworkConfig) -> NetworkConfig {
        if let Some(timeout) = self.timeout {
            config.request_timeout_ms = timeout;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        config
    }
}

impl Default for Args {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            config: None,
            debug: false,
            log_file: PathBuf::from("netfetch.log"),
            no_cache: false,
            queue: false,
            diagnostics: false,
            timeout: None,
            max_retries: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_urls_and_flags() {
        let args = Args::parse_from(["netfetch", "--no-cache", "-t", "500", "http://a/", "http://b/"]);
        assert_eq!(args.urls, vec!["http://a/", "http://b/"]);
        assert!(args.no_cache);
        assert_eq!(args.timeout, Some(500));
        assert!(!args.queue);
    }

    #[test]
    fn test_overrides_replace_config_values() {
        let args = Args {
            timeout: Some(1234),
            max_retries: Some(9),
            ..Default::default()
        };
        let config = args.apply_overrides(NetworkConfig::default());
        assert_eq!(config.request_timeout_ms, 1234);
        assert_eq!(config.max_retries, 9);

        let untouched = Args::default().apply_overrides(NetworkConfig::default());
        assert_eq!(untouched, NetworkConfig::default());
    }
}
