//! HTTP transport used to reach individual endpoint addresses
//!
//! The [`Transport`] trait is the seam between the pool and the wire: given
//! a socket address and a fully retargeted request it performs one HTTP
//! exchange. [`HttpTransport`] is the production implementation built on
//! hyper's HTTP/1.1 client connections, tokio-rustls and an idle connection
//! cache keyed by address.

pub mod connection;
pub mod request;

pub use connection::{CacheStats, ConnectionCache};
pub use request::{duplicate, IpTargetBuilder, RequestTransformer};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::{ConnectionCacheConfig, Protocol, ServerConfig};
use connection::{Checkout, Sender};

/// Error types for a single exchange
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP exchange with {addr} failed: {source}")]
    Http {
        addr: SocketAddr,
        #[source]
        source: hyper::Error,
    },

    #[error("timed out waiting for {addr} after {timeout:?}")]
    ReadTimeout { addr: SocketAddr, timeout: Duration },

    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
}

impl TransportError {
    /// Only a connect timeout is worth retrying on another endpoint
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self, TransportError::ConnectTimeout { .. })
    }
}

/// Capability to exchange one HTTP request with a specific address
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` to `target` and buffer the full response
    async fn send(
        &self,
        target: SocketAddr,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, TransportError>;

    /// SNI name presented during TLS handshakes, if TLS is used
    fn server_name(&self) -> Option<&str> {
        None
    }

    /// TLS client configuration (trust manager) used for handshakes
    fn tls_config(&self) -> Option<Arc<ClientConfig>> {
        None
    }

    /// Forget any state kept for `target` (e.g. idle connections)
    fn evict(&self, _target: SocketAddr) {}
}

/// TLS settings for [`HttpTransport`]
#[derive(Clone)]
struct TlsSettings {
    hostname: String,
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
}

/// hyper based transport with per-address connection reuse
pub struct HttpTransport {
    tls: Option<TlsSettings>,
    connect_timeout: Duration,
    cache: ConnectionCache,
}

impl HttpTransport {
    /// Plain HTTP transport
    pub fn plain(connect_timeout: Duration, cache: ConnectionCacheConfig) -> Self {
        Self {
            tls: None,
            connect_timeout,
            cache: ConnectionCache::new(cache),
        }
    }

    /// TLS transport presenting `hostname` as SNI and verifying with `config`
    pub fn with_tls(
        hostname: &str,
        config: Arc<ClientConfig>,
        connect_timeout: Duration,
        cache: ConnectionCacheConfig,
    ) -> Result<Self, TransportError> {
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| TransportError::InvalidServerName(hostname.to_string()))?;

        Ok(Self {
            tls: Some(TlsSettings {
                hostname: hostname.to_string(),
                server_name,
                config,
            }),
            connect_timeout,
            cache: ConnectionCache::new(cache),
        })
    }

    /// Transport matching the server configuration's protocol
    pub fn from_config(
        config: &ServerConfig,
        tls: Option<Arc<ClientConfig>>,
    ) -> Result<Self, TransportError> {
        match (config.protocol, tls) {
            (Protocol::Https, Some(tls)) => Self::with_tls(
                &config.hostname,
                tls,
                config.connect_timeout(),
                config.connection_cache.clone(),
            ),
            (Protocol::Https, None) => Err(TransportError::InvalidServerName(format!(
                "{} (https requires a TLS configuration)",
                config.hostname
            ))),
            (Protocol::Http, _) => Ok(Self::plain(
                config.connect_timeout(),
                config.connection_cache.clone(),
            )),
        }
    }

    /// Idle connection statistics for `addr`
    pub fn cache_stats(&self, addr: SocketAddr) -> Option<CacheStats> {
        self.cache.stats(addr)
    }

    async fn dial(&self, addr: SocketAddr) -> Result<Sender, TransportError> {
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                self.cache.record_failed(addr);
                return Err(TransportError::Connect { addr, source });
            }
            Err(_) => {
                self.cache.record_failed(addr);
                return Err(TransportError::ConnectTimeout {
                    addr,
                    timeout: self.connect_timeout,
                });
            }
        };

        // Configure TCP keep-alive and nodelay
        let socket = socket2::SockRef::from(&stream);
        socket
            .set_keepalive(true)
            .map_err(|source| TransportError::Connect { addr, source })?;
        stream
            .set_nodelay(true)
            .map_err(|source| TransportError::Connect { addr, source })?;

        let sender = match &self.tls {
            Some(tls) => {
                let connector = TlsConnector::from(Arc::clone(&tls.config));
                let stream = connector
                    .connect(tls.server_name.clone(), stream)
                    .await
                    .map_err(|source| {
                        self.cache.record_failed(addr);
                        TransportError::Tls { addr, source }
                    })?;
                Self::handshake(addr, stream).await?
            }
            None => Self::handshake(addr, stream).await?,
        };

        self.cache.record_created(addr);
        debug!(addr = %addr, tls = self.tls.is_some(), "Created new connection");
        Ok(sender)
    }

    async fn handshake<T>(addr: SocketAddr, io: T) -> Result<Sender, TransportError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(|source| TransportError::Http { addr, source })?;

        // Spawn connection driver task
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(addr = %addr, error = %e, "connection closed with error");
            }
        });

        Ok(sender)
    }

    /// Take an idle connection that is ready for a new request, or dial one
    async fn acquire(&self, addr: SocketAddr) -> Result<Checkout, TransportError> {
        while let Some(mut checkout) = self.cache.checkout(addr) {
            if checkout.sender.ready().await.is_ok() {
                return Ok(checkout);
            }
        }
        Ok(Checkout::fresh(self.dial(addr).await?))
    }
}

/// Reduce an absolute URI to origin-form for the HTTP/1.1 request line
fn to_origin_form(request: Request<Bytes>) -> Result<Request<Full<Bytes>>, TransportError> {
    let (mut parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    parts.uri = path.parse::<Uri>().map_err(hyper::http::Error::from)?;
    Ok(Request::from_parts(parts, Full::new(body)))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        target: SocketAddr,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, TransportError> {
        let request = to_origin_form(request)?;
        let mut checkout = self.acquire(target).await?;

        let response = checkout
            .sender
            .send_request(request)
            .await
            .map_err(|source| TransportError::Http {
                addr: target,
                source,
            })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|source| TransportError::Http {
                addr: target,
                source,
            })?
            .to_bytes();

        self.cache.checkin(target, checkout);
        Ok(Response::from_parts(parts, body))
    }

    fn server_name(&self) -> Option<&str> {
        self.tls.as_ref().map(|tls| tls.hostname.as_str())
    }

    fn tls_config(&self) -> Option<Arc<ClientConfig>> {
        self.tls.as_ref().map(|tls| Arc::clone(&tls.config))
    }

    fn evict(&self, target: SocketAddr) {
        self.cache.evict(target);
        info!(addr = %target, "evicted endpoint connections");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_origin_form() {
        let request = Request::get("https://10.0.0.1:443/a/b?c=d")
            .body(Bytes::new())
            .unwrap();
        let out = to_origin_form(request).unwrap();
        assert_eq!(out.uri().to_string(), "/a/b?c=d");
    }

    #[test]
    fn test_connect_timeout_classification() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 1));
        let timeout = TransportError::ConnectTimeout {
            addr,
            timeout: Duration::from_millis(10),
        };
        assert!(timeout.is_connect_timeout());

        let refused = TransportError::Connect {
            addr,
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(!refused.is_connect_timeout());
    }

    #[test]
    fn test_tls_transport_exposes_sni() {
        let roots = crate::tls::root_store(&crate::config::TlsConfig::default()).unwrap();
        let config = crate::tls::client_config("api.example.com", roots).unwrap();
        let transport = HttpTransport::with_tls(
            "api.example.com",
            config,
            Duration::from_secs(1),
            ConnectionCacheConfig::default(),
        )
        .unwrap();

        assert_eq!(transport.server_name(), Some("api.example.com"));
        assert!(transport.tls_config().is_some());

        let plain = HttpTransport::plain(Duration::from_secs(1), ConnectionCacheConfig::default());
        assert_eq!(plain.server_name(), None);
        assert!(plain.tls_config().is_none());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            HttpTransport::plain(Duration::from_secs(2), ConnectionCacheConfig::default());
        let request = Request::get("/").body(Bytes::new()).unwrap();
        let err = transport.send(addr, request).await.unwrap_err();

        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(transport.cache_stats(addr).unwrap().failed_attempts, 1);
    }
}
