use hyper::StatusCode;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::endpoint::Endpoint;
use crate::config::ServerConfig;
use crate::transport::{IpTargetBuilder, Transport, TransportError};

/// A status code means the server is reachable and answering HTTP
///
/// Anything in 200..=499 counts: a 4xx still proves the transport, TLS and
/// application layers are up.
pub fn is_healthy_status(status: StatusCode) -> bool {
    (200..=499).contains(&status.as_u16())
}

/// Result of one health probe
#[derive(Debug)]
pub enum ProbeOutcome {
    /// The server answered with this status
    Status(StatusCode),
    /// The exchange failed before a status was received
    Failed(TransportError),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        match self {
            ProbeOutcome::Status(status) => is_healthy_status(*status),
            ProbeOutcome::Failed(_) => false,
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Status(status) => write!(f, "status {}", status.as_u16()),
            ProbeOutcome::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Everything a probe needs to reach one address
pub struct ProbeContext {
    transport: Arc<dyn Transport>,
    targets: IpTargetBuilder,
    health_path: String,
    read_timeout: Duration,
}

impl ProbeContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        targets: IpTargetBuilder,
        health_path: impl Into<String>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            targets,
            health_path: health_path.into(),
            read_timeout,
        }
    }

    pub fn from_config(config: &ServerConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            transport,
            IpTargetBuilder::new(config.protocol, config.hostname.clone(), config.port),
            config.health_path.clone(),
            config.health_read_timeout(),
        )
    }

    pub fn socket_addr(&self, ip: IpAddr) -> SocketAddr {
        self.targets.socket_addr(ip)
    }

    /// `protocol://ip:port/healthPath`
    pub fn health_uri(&self, ip: IpAddr) -> String {
        self.targets
            .uri_for(ip, &self.health_path)
            .map(|uri| uri.to_string())
            .unwrap_or_else(|_| format!("{}{}", self.socket_addr(ip), self.health_path))
    }

    /// GET the health URI of `ip`, bounded by the read timeout
    pub async fn probe(&self, ip: IpAddr) -> ProbeOutcome {
        let addr = self.socket_addr(ip);
        let request = match self.targets.health_check(ip, &self.health_path) {
            Ok(request) => request,
            Err(e) => return ProbeOutcome::Failed(TransportError::Request(e)),
        };

        match tokio::time::timeout(self.read_timeout, self.transport.send(addr, request)).await {
            Ok(Ok(response)) => ProbeOutcome::Status(response.status()),
            Ok(Err(e)) => ProbeOutcome::Failed(e),
            Err(_) => ProbeOutcome::Failed(TransportError::ReadTimeout {
                addr,
                timeout: self.read_timeout,
            }),
        }
    }
}

/// Health flag shared by an endpoint and its probe task
#[derive(Debug, Default)]
pub struct HealthState {
    healthy: AtomicBool,
    probed: AtomicBool,
    last_check: RwLock<Option<Instant>>,
}

impl HealthState {
    pub fn with_health(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            probed: AtomicBool::new(false),
            last_check: RwLock::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn is_probed(&self) -> bool {
        self.probed.load(Ordering::Acquire)
    }

    /// Store the outcome of a probe, logging health transitions
    pub fn record(&self, addr: SocketAddr, outcome: &ProbeOutcome) {
        let healthy = outcome.is_healthy();
        let was_healthy = self.healthy.swap(healthy, Ordering::AcqRel);
        let first_probe = !self.probed.swap(true, Ordering::AcqRel);

        if let Ok(mut last) = self.last_check.write() {
            *last = Some(Instant::now());
        }

        if first_probe || was_healthy != healthy {
            info!(addr = %addr, healthy, outcome = %outcome, "endpoint health changed");
        } else {
            debug!(addr = %addr, healthy, outcome = %outcome, "endpoint health check");
        }
    }

    /// Time since the last completed probe
    pub fn time_since_last_check(&self) -> Option<Duration> {
        self.last_check
            .read()
            .ok()
            .and_then(|last| last.map(|at| at.elapsed()))
    }
}

/// Aggregate pool health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Every endpoint is healthy
    Ok,
    /// Some but not all endpoints are healthy
    Warning,
    /// No endpoint is healthy (including an empty pool)
    Error,
}

impl HealthStatus {
    pub fn from_counts(healthy: usize, total: usize) -> Self {
        if healthy == 0 {
            HealthStatus::Error
        } else if healthy == total {
            HealthStatus::Ok
        } else {
            HealthStatus::Warning
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Ok => "OK",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Health of a single endpoint
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub addr: SocketAddr,
    pub health_uri: Option<String>,
    pub healthy: bool,
    pub last_check: Option<Duration>,
}

/// Result of [`PoolManager::check`](crate::pool::PoolManager::check)
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub endpoints: Vec<EndpointHealth>,
}

impl HealthReport {
    pub fn from_endpoints(endpoints: &[Arc<Endpoint>]) -> Self {
        let endpoints: Vec<EndpointHealth> = endpoints
            .iter()
            .map(|endpoint| EndpointHealth {
                addr: endpoint.addr(),
                health_uri: endpoint.health_uri().map(str::to_string),
                healthy: endpoint.is_healthy(),
                last_check: endpoint.time_since_last_check(),
            })
            .collect();

        let healthy = endpoints.iter().filter(|e| e.healthy).count();
        Self {
            status: HealthStatus::from_counts(healthy, endpoints.len()),
            endpoints,
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.healthy).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use async_trait::async_trait;
    use bytes::Bytes;
    use hyper::{Request, Response};

    /// Transport answering every request with a fixed status, optionally after a delay
    struct FixedStatus {
        status: StatusCode,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for FixedStatus {
        async fn send(
            &self,
            _target: SocketAddr,
            request: Request<Bytes>,
        ) -> Result<Response<Bytes>, TransportError> {
            assert_eq!(request.headers()["host"], "api.example.com");
            tokio::time::sleep(self.delay).await;
            Ok(Response::builder()
                .status(self.status)
                .body(Bytes::new())
                .unwrap())
        }
    }

    fn context(status: StatusCode, delay: Duration) -> ProbeContext {
        ProbeContext::new(
            Arc::new(FixedStatus { status, delay }),
            IpTargetBuilder::new(Protocol::Https, "api.example.com", 443),
            "/health",
            Duration::from_millis(100),
        )
    }

    #[test]
    fn test_status_classification() {
        assert!(is_healthy_status(StatusCode::OK));
        assert!(is_healthy_status(StatusCode::NO_CONTENT));
        assert!(is_healthy_status(StatusCode::NOT_FOUND));
        assert!(is_healthy_status(StatusCode::FORBIDDEN));
        assert!(!is_healthy_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_healthy_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_healthy_status(StatusCode::SWITCHING_PROTOCOLS));
        assert!(is_healthy_status(StatusCode::MOVED_PERMANENTLY));
    }

    #[tokio::test]
    async fn test_probe_not_found_is_healthy() {
        let ctx = context(StatusCode::NOT_FOUND, Duration::ZERO);
        let outcome = ctx.probe("10.0.0.1".parse().unwrap()).await;
        assert!(outcome.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_server_error_is_unhealthy() {
        let ctx = context(StatusCode::BAD_GATEWAY, Duration::ZERO);
        let outcome = ctx.probe("10.0.0.1".parse().unwrap()).await;
        assert!(!outcome.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_timeout_is_unhealthy() {
        let ctx = context(StatusCode::OK, Duration::from_secs(5));
        let outcome = ctx.probe("10.0.0.1".parse().unwrap()).await;
        assert!(matches!(
            outcome,
            ProbeOutcome::Failed(TransportError::ReadTimeout { .. })
        ));
    }

    #[test]
    fn test_health_uri() {
        let ctx = context(StatusCode::OK, Duration::ZERO);
        assert_eq!(
            ctx.health_uri("10.0.0.1".parse().unwrap()),
            "https://10.0.0.1:443/health"
        );
    }

    #[test]
    fn test_health_state_record() {
        let state = HealthState::default();
        let addr: SocketAddr = "10.0.0.1:443".parse().unwrap();
        assert!(!state.is_healthy());
        assert!(!state.is_probed());
        assert!(state.time_since_last_check().is_none());

        state.record(addr, &ProbeOutcome::Status(StatusCode::OK));
        assert!(state.is_healthy());
        assert!(state.is_probed());
        assert!(state.time_since_last_check().is_some());

        state.record(addr, &ProbeOutcome::Status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!state.is_healthy());
    }

    #[test]
    fn test_status_from_counts() {
        assert_eq!(HealthStatus::from_counts(0, 0), HealthStatus::Error);
        assert_eq!(HealthStatus::from_counts(0, 3), HealthStatus::Error);
        assert_eq!(HealthStatus::from_counts(1, 3), HealthStatus::Warning);
        assert_eq!(HealthStatus::from_counts(2, 3), HealthStatus::Warning);
        assert_eq!(HealthStatus::from_counts(3, 3), HealthStatus::Ok);
        assert_eq!(HealthStatus::from_counts(1, 1), HealthStatus::Ok);
        assert_eq!(HealthStatus::Warning.to_string(), "WARNING");
    }
}
