//! Single logical client over the endpoint pool
//!
//! [`Dispatcher::send`] picks the next healthy endpoint, retargets the request
//! at its address and sends it. Only a connect timeout moves on to another
//! endpoint; every other failure is returned as is.

use bytes::Bytes;
use hyper::{Method, Request, Response, Uri};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::lb::EndpointSource;
use crate::transport::{duplicate, IpTargetBuilder, RequestTransformer, Transport, TransportError};

/// Upper bound on endpoints tried by one `send`
pub const MAX_ATTEMPTS: usize = 3;

/// Addresses in attempt order, comma separated
struct AddrList<'a>(&'a [SocketAddr]);

impl fmt::Display for AddrList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, addr) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", addr)?;
        }
        Ok(())
    }
}

/// Error types for dispatching a request
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no healthy endpoint for {hostname} (tried: [{}])", AddrList(.attempted))]
    NoHealthyEndpoint {
        hostname: String,
        attempted: Vec<SocketAddr>,
    },

    #[error(
        "{method} {uri} failed after {} attempts, connect timed out on [{}]",
        .attempted.len(),
        AddrList(.attempted)
    )]
    RetriesExhausted {
        attempted: Vec<SocketAddr>,
        method: Method,
        uri: Uri,
    },

    #[error("request to {addr} failed: {source}")]
    Transport {
        addr: SocketAddr,
        #[source]
        source: TransportError,
    },

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),
}

impl DispatchError {
    /// Addresses tried before giving up
    pub fn attempted(&self) -> &[SocketAddr] {
        match self {
            DispatchError::NoHealthyEndpoint { attempted, .. }
            | DispatchError::RetriesExhausted { attempted, .. } => attempted,
            _ => &[],
        }
    }
}

/// Retrying client bound to one logical hostname
#[derive(Clone)]
pub struct Dispatcher {
    source: Arc<dyn EndpointSource>,
    transport: Arc<dyn Transport>,
    targets: IpTargetBuilder,
    transformer: Option<RequestTransformer>,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn EndpointSource>,
        transport: Arc<dyn Transport>,
        targets: IpTargetBuilder,
    ) -> Self {
        Self {
            source,
            transport,
            targets,
            transformer: None,
        }
    }

    pub fn from_config(
        config: &ServerConfig,
        source: Arc<dyn EndpointSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let targets = IpTargetBuilder::new(config.protocol, config.hostname.clone(), config.port);
        Self::new(source, transport, targets).with_transformer(config.transformer.clone())
    }

    /// Hook applied to every attempt before retargeting
    pub fn with_transformer(mut self, transformer: Option<RequestTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn hostname(&self) -> &str {
        self.targets.hostname()
    }

    /// Send `request`, moving to another endpoint after a connect timeout
    ///
    /// At most [`MAX_ATTEMPTS`] endpoints are tried. The request URI only
    /// contributes its path and query; the authority always comes from the
    /// chosen endpoint.
    pub async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, DispatchError> {
        let mut attempted = Vec::with_capacity(MAX_ATTEMPTS);

        for attempt in 1..=MAX_ATTEMPTS {
            let (addr, outcome) = self.attempt(duplicate(&request), &attempted).await?;

            match outcome {
                Ok(response) => {
                    if attempt > 1 {
                        info!(addr = %addr, attempt, "request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(e) if e.is_connect_timeout() => {
                    warn!(addr = %addr, attempt, error = %e, "connect timed out, trying next endpoint");
                    attempted.push(addr);
                }
                Err(source) => return Err(DispatchError::Transport { addr, source }),
            }
        }

        Err(DispatchError::RetriesExhausted {
            attempted,
            method: request.method().clone(),
            uri: request.uri().clone(),
        })
    }

    /// Send `request` on a background task with a single attempt
    ///
    /// Unlike [`send`](Self::send) a connect timeout is not retried.
    pub fn send_async(
        &self,
        request: Request<Bytes>,
    ) -> JoinHandle<Result<Response<Bytes>, DispatchError>> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let (addr, outcome) = dispatcher.attempt(request, &[]).await?;
            outcome.map_err(|source| DispatchError::Transport { addr, source })
        })
    }

    /// One exchange with the next endpoint
    async fn attempt(
        &self,
        request: Request<Bytes>,
        attempted: &[SocketAddr],
    ) -> Result<(SocketAddr, Result<Response<Bytes>, TransportError>), DispatchError> {
        let endpoint = self
            .source
            .next_endpoint()
            .ok_or_else(|| DispatchError::NoHealthyEndpoint {
                hostname: self.targets.hostname().to_string(),
                attempted: attempted.to_vec(),
            })?;

        let request = match &self.transformer {
            Some(transform) => transform(request),
            None => request,
        };
        let request = self.targets.retarget(request, endpoint.ip())?;
        let addr = endpoint.addr();

        debug!(addr = %addr, method = %request.method(), uri = %request.uri(), "dispatching request");
        Ok((addr, self.transport.send(addr, request).await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::lb::{Endpoint, RoundRobinSelector};
    use async_trait::async_trait;
    use hyper::header::HOST;
    use hyper::StatusCode;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Connect-times-out for `timeout_on`, refuses for `refuse_on`, otherwise 200
    #[derive(Default)]
    struct Scripted {
        timeout_on: Vec<SocketAddr>,
        refuse_on: Vec<SocketAddr>,
        seen: Mutex<Vec<(SocketAddr, Request<Bytes>)>>,
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(
            &self,
            target: SocketAddr,
            request: Request<Bytes>,
        ) -> Result<Response<Bytes>, TransportError> {
            self.seen.lock().unwrap().push((target, request));
            if self.timeout_on.contains(&target) {
                return Err(TransportError::ConnectTimeout {
                    addr: target,
                    timeout: Duration::from_millis(10),
                });
            }
            if self.refuse_on.contains(&target) {
                return Err(TransportError::Connect {
                    addr: target,
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                });
            }
            Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Bytes::from_static(b"ok"))
                .unwrap())
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn dispatcher(members: &[&str], transport: Arc<Scripted>) -> Dispatcher {
        let endpoints = members
            .iter()
            .map(|m| Endpoint::unscheduled(addr(m), true))
            .collect();
        Dispatcher::new(
            Arc::new(RoundRobinSelector::with_order(endpoints)),
            transport,
            IpTargetBuilder::new(Protocol::Http, "api.example.com", 8080),
        )
    }

    #[tokio::test]
    async fn test_request_is_retargeted() {
        let transport = Arc::new(Scripted::default());
        let dispatcher = dispatcher(&["10.0.0.1:8080"], transport.clone());

        let request = Request::post("http://api.example.com:8080/v1/items?limit=5")
            .body(Bytes::from_static(b"{}"))
            .unwrap();
        let response = dispatcher.send(request).await.unwrap();
        assert_eq!(response.body().as_ref(), b"ok");

        let seen = transport.seen.lock().unwrap();
        let (target, sent) = &seen[0];
        assert_eq!(*target, addr("10.0.0.1:8080"));
        assert_eq!(sent.method(), Method::POST);
        assert_eq!(sent.uri().to_string(), "http://10.0.0.1:8080/v1/items?limit=5");
        assert_eq!(sent.headers()[HOST], "api.example.com:8080");
        assert_eq!(sent.body().as_ref(), b"{}");
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let transport = Arc::new(Scripted {
            refuse_on: vec![addr("10.0.0.1:8080")],
            ..Default::default()
        });
        let dispatcher = dispatcher(&["10.0.0.1:8080", "10.0.0.2:8080"], transport.clone());

        let err = dispatcher
            .send(Request::get("/").body(Bytes::new()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Transport { .. }));
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_healthy_endpoint() {
        let transport = Arc::new(Scripted::default());
        let dispatcher = dispatcher(&[], transport);

        let err = dispatcher
            .send(Request::get("/").body(Bytes::new()).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoHealthyEndpoint { .. }));
        assert!(err.attempted().is_empty());
        assert!(err.to_string().contains("api.example.com"));
    }

    #[tokio::test]
    async fn test_transformer_runs_before_send() {
        let transport = Arc::new(Scripted::default());
        let transformer: RequestTransformer = Arc::new(|mut request: Request<Bytes>| {
            request
                .headers_mut()
                .insert("x-trace", "abc".parse().unwrap());
            request
        });
        let dispatcher =
            dispatcher(&["10.0.0.1:8080"], transport.clone()).with_transformer(Some(transformer));

        dispatcher
            .send(Request::get("/").body(Bytes::new()).unwrap())
            .await
            .unwrap();
        assert_eq!(transport.seen.lock().unwrap()[0].1.headers()["x-trace"], "abc");
    }

    #[tokio::test]
    async fn test_send_async_does_not_retry() {
        let transport = Arc::new(Scripted {
            timeout_on: vec![addr("10.0.0.1:8080")],
            ..Default::default()
        });
        let dispatcher = dispatcher(&["10.0.0.1:8080", "10.0.0.2:8080"], transport.clone());

        let result = dispatcher
            .send_async(Request::get("/").body(Bytes::new()).unwrap())
            .await
            .unwrap();
        match result {
            Err(DispatchError::Transport { addr: failed, source }) => {
                assert_eq!(failed, addr("10.0.0.1:8080"));
                assert!(source.is_connect_timeout());
            }
            other => panic!("expected transport error, got {:?}", other.map(|r| r.status())),
        }
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_exhausted_message_lists_addresses() {
        let err = DispatchError::RetriesExhausted {
            attempted: vec![addr("10.0.0.1:443"), addr("10.0.0.2:443")],
            method: Method::GET,
            uri: "/x".parse().unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "GET /x failed after 2 attempts, connect timed out on [10.0.0.1:443, 10.0.0.2:443]"
        );
    }
}
