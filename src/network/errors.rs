//! Fetch pipeline error types with context and categories
//!
//! Every failure the pipeline can produce is a [`FetchError`]. Errors are
//! classified into an [`ErrorCategory`] once, and that category alone decides
//! whether the retry controller may try again.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Error categories for classification and retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Transient network failures (reset, temporary DNS failure)
    Network,
    /// Permanent DNS resolution failures
    Dns,
    /// Connection establishment failures
    Connection,
    /// Timeout errors
    Timeout,
    /// Malformed responses and error statuses
    Protocol,
    /// Resource exhaustion (pool ceiling reached)
    Resource,
    /// Input validation errors
    Validation,
    /// TLS/SSL errors
    Tls,
    /// Downloaded content failed verification
    Integrity,
    /// The caller abandoned the fetch
    Cancelled,
}

impl ErrorCategory {
    /// Whether errors in this category may be retried by the retry controller
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorCategory::Network | ErrorCategory::Timeout)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "Network"),
            ErrorCategory::Dns => write!(f, "DNS"),
            ErrorCategory::Connection => write!(f, "Connection"),
            ErrorCategory::Timeout => write!(f, "Timeout"),
            ErrorCategory::Protocol => write!(f, "Protocol"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Validation => write!(f, "Validation"),
            ErrorCategory::Tls => write!(f, "TLS/SSL"),
            ErrorCategory::Integrity => write!(f, "Integrity"),
            ErrorCategory::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Pipeline stage an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Request,
    Cache,
    Resolve,
    Connect,
    Send,
    Receive,
    Queue,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Request => "request",
            Stage::Cache => "cache",
            Stage::Resolve => "resolve",
            Stage::Connect => "connect",
            Stage::Send => "send",
            Stage::Receive => "receive",
            Stage::Queue => "queue",
        };
        f.write_str(name)
    }
}

/// Errors produced by the fetch pipeline
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("DNS resolution failed for '{host}': {reason}")]
    Resolution {
        host: String,
        reason: String,
        /// Nameserver failure or timeout, as opposed to a definitive answer
        temporary: bool,
        /// Replayed from the negative cache without querying
        negative_cached: bool,
    },

    #[error("Connection pool exhausted for {key} after waiting {waited:?} ({busy}/{max_total} busy)")]
    PoolExhausted {
        key: String,
        waited: Duration,
        busy: usize,
        max_total: usize,
    },

    #[error("{stage} timed out after {elapsed:?}")]
    Timeout { stage: Stage, elapsed: Duration },

    #[error("Connection reset by {addr}")]
    ConnectionReset { addr: SocketAddr },

    #[error("Connection refused by {addr}")]
    ConnectionRefused { addr: SocketAddr },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("HTTP status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("TLS error for {host}: {reason}")]
    Tls { host: String, reason: String },

    #[error("Verification failed: {reason}")]
    VerificationFailed { reason: String },

    #[error("Download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Fetch cancelled")]
    Cancelled,

    #[error("Giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Shorthand for a malformed-response error
    pub fn protocol(message: impl Into<String>) -> Self {
        FetchError::Protocol {
            message: message.into(),
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            FetchError::Resolution { temporary: true, .. } => ErrorCategory::Network,
            FetchError::Resolution { .. } => ErrorCategory::Dns,
            FetchError::PoolExhausted { .. } => ErrorCategory::Resource,
            FetchError::Timeout { .. } => ErrorCategory::Timeout,
            FetchError::ConnectionReset { .. } => ErrorCategory::Network,
            FetchError::ConnectionRefused { .. } => ErrorCategory::Connection,
            FetchError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => ErrorCategory::Timeout,
                std::io::ErrorKind::ConnectionRefused => ErrorCategory::Connection,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::Interrupted => ErrorCategory::Network,
                _ => ErrorCategory::Connection,
            },
            FetchError::Protocol { .. } | FetchError::Status { .. } => ErrorCategory::Protocol,
            FetchError::InvalidUrl { .. } => ErrorCategory::Validation,
            FetchError::Tls { .. } => ErrorCategory::Tls,
            FetchError::VerificationFailed { .. } | FetchError::DownloadFailed { .. } => {
                ErrorCategory::Integrity
            }
            FetchError::Cancelled => ErrorCategory::Cancelled,
            FetchError::RetriesExhausted { source, .. } => source.category(),
        }
    }

    /// Whether this error is retriable
    pub fn is_retriable(&self) -> bool {
        match self {
            // the budget is already spent
            FetchError::RetriesExhausted { .. } => false,
            _ => self.category().is_retriable(),
        }
    }

    /// Number of attempts behind this error (1 unless retries were exhausted)
    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// Pipeline stage this error most likely came from
    pub fn stage(&self) -> Stage {
        match self {
            FetchError::InvalidUrl { .. } => Stage::Request,
            FetchError::Resolution { .. } => Stage::Resolve,
            FetchError::PoolExhausted { .. }
            | FetchError::ConnectionRefused { .. }
            | FetchError::Tls { .. } => Stage::Connect,
            FetchError::Timeout { stage, .. } => *stage,
            FetchError::RetriesExhausted { source, .. } => source.stage(),
            _ => Stage::Receive,
        }
    }

    /// Get a user-friendly suggestion for resolving this error
    pub fn suggestion(&self) -> String {
        match self {
            FetchError::Resolution { host, negative_cached: true, .. } => format!(
                "'{}' failed to resolve recently. Wait for the negative cache entry to expire or clear the DNS cache.",
                host
            ),
            FetchError::Resolution { host, .. } => format!(
                "Check if '{}' is spelled correctly and that the configured DNS servers are reachable.",
                host
            ),
            FetchError::PoolExhausted { max_total, .. } => format!(
                "All {} connections are busy. Retry later or raise max_connections.",
                max_total
            ),
            FetchError::ConnectionRefused { addr } => format!(
                "No service is listening on {}. Verify the port is correct and the service is running.",
                addr
            ),
            FetchError::Timeout { .. } => {
                "The remote side is slow to answer. Try increasing request_timeout_ms.".to_string()
            }
            FetchError::InvalidUrl { reason, .. } => format!("Fix the URL: {}", reason),
            FetchError::Tls { .. } => {
                "Secure transport requires a configured TLS provider and a valid CA bundle.".to_string()
            }
            FetchError::Cancelled => "The fetch was abandoned by the caller.".to_string(),
            FetchError::RetriesExhausted { source, .. } => source.suggestion(),
            _ => "Check network connectivity and target availability.".to_string(),
        }
    }

    /// Get an error code for programmatic handling
    pub fn code(&self) -> i32 {
        match self {
            FetchError::Resolution { .. } => 6, // CURLE_COULDNT_RESOLVE_HOST
            FetchError::PoolExhausted { .. } => 89, // CURLE_NO_CONNECTION_AVAILABLE
            FetchError::Timeout { .. } => 28,   // CURLE_OPERATION_TIMEDOUT
            FetchError::ConnectionReset { .. } => 56, // CURLE_RECV_ERROR
            FetchError::ConnectionRefused { .. } => 7, // CURLE_COULDNT_CONNECT
            FetchError::Io(_) => 55,            // CURLE_SEND_ERROR
            FetchError::Protocol { .. } => 8,   // CURLE_WEIRD_SERVER_REPLY
            FetchError::Status { .. } => 22,    // CURLE_HTTP_RETURNED_ERROR
            FetchError::InvalidUrl { .. } => 3, // CURLE_URL_MALFORMAT
            FetchError::Tls { .. } => 35,       // CURLE_SSL_CONNECT_ERROR
            FetchError::VerificationFailed { .. } => 61, // CURLE_BAD_CONTENT_ENCODING
            FetchError::DownloadFailed { .. } => 23, // CURLE_WRITE_ERROR
            FetchError::Cancelled => 42,        // CURLE_ABORTED_BY_CALLBACK
            FetchError::RetriesExhausted { source, .. } => source.code(),
        }
    }
}

/// Error context wrapper for logging a failure with its metadata
#[derive(Debug)]
pub struct ErrorContext<'a> {
    /// The underlying error
    pub error: &'a FetchError,
    /// Stage the error surfaced from
    pub stage: Stage,
    /// URL or host being fetched
    pub target: String,
    /// When the error occurred
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// How long the operation took before failing
    pub duration: Duration,
}

impl<'a> ErrorContext<'a> {
    /// Create a new error context
    pub fn new(error: &'a FetchError, stage: Stage, target: impl Into<String>) -> Self {
        Self {
            error,
            stage,
            target: target.into(),
            timestamp: chrono::Utc::now(),
            duration: Duration::ZERO,
        }
    }

    /// Set the duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Attempts made before the error surfaced
    pub fn attempts(&self) -> u32 {
        self.error.attempts()
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        self.error.category()
    }
}

impl fmt::Display for ErrorContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} failed for {} after {:?}",
            self.timestamp.format("%H:%M:%S"),
            self.stage,
            self.target,
            self.duration
        )?;

        if self.attempts() > 1 {
            write!(f, " ({} attempts)", self.attempts())?;
        }

        write!(f, "\nError [{}]: {}", self.category(), self.error)?;
        write!(f, "\nSuggestion: {}", self.error.suggestion())
    }
}

/// Convert std::io::Error to FetchError with more context
pub fn from_io_error(e: std::io::Error, addr: Option<SocketAddr>, stage: Stage) -> FetchError {
    match (e.kind(), addr) {
        (std::io::ErrorKind::ConnectionRefused, Some(addr)) => FetchError::ConnectionRefused { addr },
        (std::io::ErrorKind::ConnectionReset, Some(addr)) => FetchError::ConnectionReset { addr },
        (std::io::ErrorKind::TimedOut, _) => FetchError::Timeout {
            stage,
            elapsed: Duration::ZERO,
        },
        _ => FetchError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn test_addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 80))
    }

    fn resolution(temporary: bool) -> FetchError {
        FetchError::Resolution {
            host: "example.com".to_string(),
            reason: "NXDOMAIN".to_string(),
            temporary,
            negative_cached: false,
        }
    }

    #[test]
    fn test_error_category_retriable() {
        assert!(ErrorCategory::Network.is_retriable());
        assert!(ErrorCategory::Timeout.is_retriable());
        assert!(!ErrorCategory::Dns.is_retriable());
        assert!(!ErrorCategory::Protocol.is_retriable());
        assert!(!ErrorCategory::Resource.is_retriable());
        assert!(!ErrorCategory::Cancelled.is_retriable());
    }

    #[test]
    fn test_resolution_classification() {
        assert_eq!(resolution(false).category(), ErrorCategory::Dns);
        assert!(!resolution(false).is_retriable());
        assert_eq!(resolution(true).category(), ErrorCategory::Network);
        assert!(resolution(true).is_retriable());
    }

    #[test]
    fn test_transient_vs_fatal() {
        assert!(FetchError::ConnectionReset { addr: test_addr() }.is_retriable());
        assert!(FetchError::Timeout {
            stage: Stage::Receive,
            elapsed: Duration::from_secs(5),
        }
        .is_retriable());
        assert!(!FetchError::protocol("bad status line").is_retriable());
        assert!(!FetchError::PoolExhausted {
            key: "127.0.0.1:80".to_string(),
            waited: Duration::from_secs(1),
            busy: 1,
            max_total: 1,
        }
        .is_retriable());
        assert!(!FetchError::Cancelled.is_retriable());
    }

    #[test]
    fn test_io_error_classification() {
        let reset = FetchError::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(reset.category(), ErrorCategory::Network);

        let eof = FetchError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
        assert!(eof.is_retriable());

        let denied = FetchError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no"));
        assert!(!denied.is_retriable());
    }

    #[test]
    fn test_retries_exhausted_wraps_source() {
        let err = FetchError::RetriesExhausted {
            attempts: 3,
            source: Box::new(FetchError::ConnectionReset { addr: test_addr() }),
        };
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(!err.is_retriable());
        assert_eq!(err.code(), 56);
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_error_code() {
        assert_eq!(resolution(false).code(), 6);
        assert_eq!(FetchError::ConnectionRefused { addr: test_addr() }.code(), 7);
        assert_eq!(FetchError::Cancelled.code(), 42);
    }

    #[test]
    fn test_error_suggestion() {
        let err = FetchError::ConnectionRefused { addr: test_addr() };
        assert!(err.suggestion().contains("service"));

        let err = FetchError::Resolution {
            host: "gone.invalid".to_string(),
            reason: "NXDOMAIN".to_string(),
            temporary: false,
            negative_cached: true,
        };
        assert!(err.suggestion().contains("negative cache"));
    }

    #[test]
    fn test_error_context_display() {
        let err = FetchError::RetriesExhausted {
            attempts: 4,
            source: Box::new(resolution(true)),
        };
        let ctx = ErrorContext::new(&err, Stage::Resolve, "http://example.com/")
            .with_duration(Duration::from_millis(50));

        let display = format!("{}", ctx);
        assert!(display.contains("resolve failed"));
        assert!(display.contains("example.com"));
        assert!(display.contains("4 attempts"));
        assert!(display.contains("NXDOMAIN"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = from_io_error(io_err, Some(test_addr()), Stage::Connect);
        assert!(matches!(err, FetchError::ConnectionRefused { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let err = from_io_error(io_err, None, Stage::Receive);
        assert!(matches!(err, FetchError::Timeout { stage: Stage::Receive, .. }));
    }

    #[test]
    fn test_error_stage() {
        assert_eq!(resolution(true).stage(), Stage::Resolve);
        assert_eq!(FetchError::ConnectionRefused { addr: test_addr() }.stage(), Stage::Connect);
        let exhausted = FetchError::RetriesExhausted {
            attempts: 2,
            source: Box::new(FetchError::Timeout {
                stage: Stage::Send,
                elapsed: Duration::from_secs(1),
            }),
        };
        assert_eq!(exhausted.stage(), Stage::Send);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(format!("{}", ErrorCategory::Network), "Network");
        assert_eq!(format!("{}", ErrorCategory::Dns), "DNS");
        assert_eq!(format!("{}", Stage::Connect), "connect");
    }
}
