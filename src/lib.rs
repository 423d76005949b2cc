//! hostpool - resilient HTTP client for one logical hostname
//!
//! Resolves the hostname to every address it has, health-checks each address
//! on its own schedule, spreads requests round-robin over the healthy ones and
//! retries on another address when a connection cannot be established in
//! time. TLS is always verified against the logical hostname even though
//! sockets are opened against raw IP addresses.

pub mod cli;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod lb;
pub mod pool;
pub mod tls;
pub mod transport;

pub use config::ServerConfig;
pub use crate::core::Core;
pub use dispatch::{DispatchError, Dispatcher, MAX_ATTEMPTS};
pub use lb::{Endpoint, EndpointSource, HealthReport, HealthStatus, RoundRobinSelector};
pub use pool::PoolManager;
pub use transport::{HttpTransport, IpTargetBuilder, Transport, TransportError};
