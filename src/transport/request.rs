//! Retargeting requests at a specific endpoint address
//!
//! Applications address the logical hostname. Before a request goes on the
//! wire its URI is rewritten to the literal IP of the chosen endpoint while
//! the `Host` header keeps naming the logical hostname, so virtual hosting and
//! certificate checks still see the name the application asked for.

use bytes::Bytes;
use hyper::header::{HeaderValue, HOST};
use hyper::{Method, Request, Uri};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::config::Protocol;

/// Hook applied to every outgoing request before it is retargeted
pub type RequestTransformer = Arc<dyn Fn(Request<Bytes>) -> Request<Bytes> + Send + Sync>;

/// Builds requests aimed at one IP address on behalf of a logical hostname
#[derive(Debug, Clone)]
pub struct IpTargetBuilder {
    protocol: Protocol,
    hostname: String,
    port: u16,
}

impl IpTargetBuilder {
    pub fn new(protocol: Protocol, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            hostname: hostname.into(),
            port,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Socket address used to reach `ip`
    pub fn socket_addr(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.port)
    }

    /// Value of the `Host` header: the hostname, plus the port when it is not the scheme default
    pub fn host_header(&self) -> String {
        if self.port == self.protocol.default_port() {
            self.hostname.clone()
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }

    /// `protocol://ip:port/path` for the given address
    pub fn uri_for(&self, ip: IpAddr, path_and_query: &str) -> Result<Uri, hyper::http::Error> {
        let path = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };
        let uri = format!("{}://{}{}", self.protocol.scheme(), self.socket_addr(ip), path)
            .parse::<Uri>()?;
        Ok(uri)
    }

    /// Rewrite `request` so that it targets `ip`
    ///
    /// Method, headers, version and body are preserved. Only the path and
    /// query of the original URI survive; scheme and authority come from this
    /// builder. The `Host` header is always set to the logical hostname.
    pub fn retarget(
        &self,
        mut request: Request<Bytes>,
        ip: IpAddr,
    ) -> Result<Request<Bytes>, hyper::http::Error> {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        *request.uri_mut() = self.uri_for(ip, &path)?;
        let host = HeaderValue::from_str(&self.host_header())?;
        request.headers_mut().insert(HOST, host);
        Ok(request)
    }

    /// Health probe request for `ip`
    pub fn health_check(&self, ip: IpAddr, health_path: &str) -> Result<Request<Bytes>, hyper::http::Error> {
        Request::builder()
            .method(Method::GET)
            .uri(self.uri_for(ip, health_path)?)
            .header(HOST, self.host_header())
            .body(Bytes::new())
    }
}

/// Copy a request so it can be sent more than once (extensions are not carried over)
pub fn duplicate(request: &Request<Bytes>) -> Request<Bytes> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}
