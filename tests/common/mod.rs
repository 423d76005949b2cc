//! Shared helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use hostpool::transport::{Transport, TransportError};

/// What the scripted transport does for one address
#[derive(Debug, Clone, Copy)]
pub enum Script {
    Status(u16),
    ConnectTimeout,
    Refused,
}

/// Transport answering from a per-address script (200 when unscripted)
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<SocketAddr, Script>>,
    calls: Mutex<Vec<SocketAddr>>,
    evicted: Mutex<Vec<SocketAddr>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, addr: SocketAddr, script: Script) {
        self.scripts.lock().unwrap().insert(addr, script);
    }

    pub fn calls(&self) -> Vec<SocketAddr> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn evicted(&self) -> Vec<SocketAddr> {
        self.evicted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        target: SocketAddr,
        _request: Request<Bytes>,
    ) -> Result<Response<Bytes>, TransportError> {
        self.calls.lock().unwrap().push(target);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&target)
            .copied()
            .unwrap_or(Script::Status(200));

        match script {
            Script::Status(code) => Ok(Response::builder()
                .status(code)
                .body(Bytes::from_static(b"scripted"))
                .unwrap()),
            Script::ConnectTimeout => Err(TransportError::ConnectTimeout {
                addr: target,
                timeout: Duration::from_millis(50),
            }),
            Script::Refused => Err(TransportError::Connect {
                addr: target,
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            }),
        }
    }

    fn evict(&self, target: SocketAddr) {
        self.evicted.lock().unwrap().push(target);
    }
}

/// Host header and path of a request seen by a [`TestServer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub host: Option<String>,
    pub path: String,
}

/// Local HTTP/1.1 server answering every request with a fixed status
pub struct TestServer {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<Seen>>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn plain(status: StatusCode) -> Self {
        Self::spawn(status, None).await
    }

    pub async fn tls(status: StatusCode, acceptor: TlsAcceptor) -> Self {
        Self::spawn(status, Some(acceptor)).await
    }

    async fn spawn(status: StatusCode, acceptor: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&seen);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                let recorded = Arc::clone(&recorded);
                let acceptor = acceptor.clone();

                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            // Handshake failures are expected in mismatch tests
                            if let Ok(stream) = acceptor.accept(stream).await {
                                serve(stream, status, recorded).await;
                            }
                        }
                        None => serve(stream, status, recorded).await,
                    }
                });
            }
        });

        Self { addr, seen, task }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<I>(io: I, status: StatusCode, recorded: Arc<Mutex<Vec<Seen>>>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let recorded = Arc::clone(&recorded);
        async move {
            recorded.lock().unwrap().push(Seen {
                host: req
                    .headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                path: req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_default(),
            });
            Ok::<_, Infallible>(
                Response::builder()
                    .status(status)
                    .body(Full::new(Bytes::from_static(b"hello")))
                    .unwrap(),
            )
        }
    });

    let _ = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(io), service)
        .await;
}

/// An address on localhost that refuses connections
pub fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
