//! Transport connections: HTTP/1.1 over TCP, optionally wrapped in TLS
//!
//! The pool only deals in [`Connection`] trait objects produced by a
//! [`Connector`], so tests and embedders can substitute their own transport.
//! TLS itself is never implemented here; secure connections are handed to an
//! injected [`TlsProvider`].

use crate::config::NetworkConfig;
use crate::network::connection_pool::ConnectionKey;
use crate::network::errors::{from_io_error, FetchError, Stage};
use crate::network::http::{
    decode_chunked, encode_request, parse_head, BodyFraming, Request, Response,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Size of each socket read
const READ_CHUNK: usize = 16 * 1024;

/// A byte stream a connection can run HTTP over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// An established transport connection able to carry request/response exchanges
#[async_trait]
pub trait Connection: Send {
    /// Send one request and read its complete response within `timeout`
    async fn send(
        &mut self,
        request: &Request,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Response, FetchError>;

    /// Whether the connection can carry another exchange (not closed by
    /// either side)
    fn is_open(&self) -> bool;
}

/// Opens new connections for the pool
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        key: &ConnectionKey,
        host: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, FetchError>;
}

/// External security collaborator wrapping plain TCP streams in TLS
#[async_trait]
pub trait TlsProvider: Send + Sync {
    /// Perform the handshake and certificate validation for `host`
    async fn wrap(
        &self,
        stream: TcpStream,
        host: &str,
        ca_bundle: Option<&Path>,
    ) -> Result<Box<dyn AsyncStream>, FetchError>;
}

/// Connector dialing TCP, with TLS delegated to an optional provider
pub struct TcpConnector {
    tls: Option<Arc<dyn TlsProvider>>,
    ca_bundle: RwLock<Option<PathBuf>>,
    max_response_bytes: AtomicUsize,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            tls: None,
            ca_bundle: RwLock::new(None),
            max_response_bytes: AtomicUsize::new(NetworkConfig::default().max_response_bytes),
        }
    }

    pub fn with_tls(mut self, provider: Arc<dyn TlsProvider>) -> Self {
        self.tls = Some(provider);
        self
    }

    /// Set the CA bundle handed to the TLS provider
    pub fn set_ca_bundle(&self, path: Option<PathBuf>) {
        *self.ca_bundle.write() = path;
    }

    /// Body size limit for connections opened from now on
    pub fn set_max_response_bytes(&self, limit: usize) {
        self.max_response_bytes.store(limit, Ordering::Relaxed);
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        key: &ConnectionKey,
        host: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, FetchError> {
        // fail before dialing when the connection could never be secured
        if key.is_tls && self.tls.is_none() {
            return Err(FetchError::Tls {
                host: host.to_string(),
                reason: "no TLS provider configured".to_string(),
            });
        }

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(key.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(from_io_error(e, Some(key.addr), Stage::Connect)),
            Err(_) => {
                return Err(FetchError::Timeout {
                    stage: Stage::Connect,
                    elapsed: timeout,
                })
            }
        };
        stream.set_nodelay(true)?;
        tracing::debug!("Connected to {} for {}", key, host);

        let stream = match &self.tls {
            Some(provider) if key.is_tls => {
                let ca_bundle = self.ca_bundle.read().clone();
                Stream::Secure(provider.wrap(stream, host, ca_bundle.as_deref()).await?)
            }
            _ => Stream::Plain(stream),
        };

        let limit = self.max_response_bytes.load(Ordering::Relaxed);
        Ok(Box::new(HttpConnection::new(stream, key.addr, limit)))
    }
}

/// Underlying byte stream of an [`HttpConnection`]
pub enum Stream {
    Plain(TcpStream),
    Secure(Box<dyn AsyncStream>),
}

impl Stream {
    fn io(&mut self) -> &mut dyn AsyncStream {
        match self {
            Stream::Plain(stream) => stream,
            Stream::Secure(stream) => stream.as_mut(),
        }
    }

    /// Detect a peer that closed (or sent unsolicited data on) an idle stream
    fn peer_closed(&self) -> bool {
        match self {
            Stream::Plain(stream) => {
                let mut peek = [0u8; 1];
                match stream.try_read(&mut peek) {
                    Ok(_) => true,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
                    Err(_) => true,
                }
            }
            // the provider's stream offers no non-blocking peek
            Stream::Secure(_) => false,
        }
    }
}

/// HTTP/1.1 connection with keep-alive
pub struct HttpConnection {
    stream: Stream,
    peer: SocketAddr,
    buf: Vec<u8>,
    reusable: bool,
    max_body: usize,
}

impl HttpConnection {
    pub fn new(stream: Stream, peer: SocketAddr, max_body: usize) -> Self {
        Self {
            stream,
            peer,
            buf: Vec::with_capacity(READ_CHUNK),
            reusable: true,
            max_body,
        }
    }

    async fn read_more(&mut self) -> Result<usize, FetchError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self
            .stream
            .io()
            .read(&mut chunk)
            .await
            .map_err(|e| from_io_error(e, Some(self.peer), Stage::Receive))?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn too_large(&self) -> FetchError {
        FetchError::protocol(format!(
            "response body from {} exceeds {} bytes",
            self.peer, self.max_body
        ))
    }

    fn closed_early(&self, what: &str) -> FetchError {
        FetchError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("connection to {} closed {}", self.peer, what),
        ))
    }

    async fn exchange(&mut self, request: &Request, user_agent: &str) -> Result<Response, FetchError> {
        self.buf.clear();
        let bytes = encode_request(request, user_agent);
        let io = self.stream.io();
        io.write_all(&bytes)
            .await
            .map_err(|e| from_io_error(e, Some(self.peer), Stage::Send))?;
        io.flush()
            .await
            .map_err(|e| from_io_error(e, Some(self.peer), Stage::Send))?;

        let head = loop {
            if let Some(head) = parse_head(&self.buf)? {
                self.buf.drain(..head.header_len);
                // interim responses precede the real one
                if (100..200).contains(&head.status) && head.status != 101 {
                    continue;
                }
                break head;
            }
            if self.read_more().await? == 0 {
                return Err(if self.buf.is_empty() {
                    self.closed_early("before responding")
                } else {
                    FetchError::protocol("connection closed inside response head")
                });
            }
        };

        let framing = head.framing(request.method())?;
        let body = match framing {
            BodyFraming::Empty => Vec::new(),
            BodyFraming::Length(len) => {
                if len > self.max_body {
                    return Err(self.too_large());
                }
                while self.buf.len() < len {
                    if self.read_more().await? == 0 {
                        return Err(self.closed_early("inside response body"));
                    }
                }
                self.buf.drain(..len).collect()
            }
            BodyFraming::Chunked => loop {
                if let Some((body, used)) = decode_chunked(&self.buf, self.max_body)? {
                    self.buf.drain(..used);
                    break body;
                }
                if self.buf.len() > self.max_body.saturating_mul(2).saturating_add(READ_CHUNK) {
                    return Err(self.too_large());
                }
                if self.read_more().await? == 0 {
                    return Err(self.closed_early("inside chunked body"));
                }
            },
            BodyFraming::UntilClose => {
                while self.read_more().await? > 0 {
                    if self.buf.len() > self.max_body {
                        return Err(self.too_large());
                    }
                }
                std::mem::take(&mut self.buf)
            }
        };

        self.reusable =
            head.keep_alive() && framing != BodyFraming::UntilClose && self.buf.is_empty();

        Ok(Response::new(head.status, head.reason, head.headers, body))
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn send(
        &mut self,
        request: &Request,
        user_agent: &str,
        timeout: Duration,
    ) -> Result<Response, FetchError> {
        match tokio::time::timeout(timeout, self.exchange(request, user_agent)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.reusable = false;
                Err(e)
            }
            Err(_) => {
                self.reusable = false;
                Err(FetchError::Timeout {
                    stage: Stage::Receive,
                    elapsed: timeout,
                })
            }
        }
    }

    fn is_open(&self) -> bool {
        self.reusable && !self.stream.peer_closed()
    }
}
