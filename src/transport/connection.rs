//! Idle HTTP/1.1 connection cache
//!
//! Each target address keeps a small stack of idle connections. A connection
//! is handed back after a complete exchange and reused by the next request to
//! the same address while it is still open and has not been idle too long.

use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http1::SendRequest;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::ConnectionCacheConfig;

/// Sender half of an HTTP/1.1 connection
pub type Sender = SendRequest<Full<Bytes>>;

/// Statistics for one target address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total connections dialed
    pub total_created: u64,

    /// Total times an idle connection was reused
    pub total_reused: u64,

    /// Idle connections currently cached
    pub idle_connections: usize,

    /// Failed dial attempts
    pub failed_attempts: u64,
}

/// A cached connection
struct IdleConnection {
    sender: Sender,

    /// When the connection was returned to the cache
    idle_since: Instant,

    /// Number of exchanges carried so far
    use_count: u64,

    created_at: Instant,
}

impl IdleConnection {
    fn is_usable(&self, max_idle: Duration) -> bool {
        !self.sender.is_closed() && self.idle_since.elapsed() < max_idle
    }
}

/// A connection checked out of the cache, or freshly dialed
pub struct Checkout {
    pub sender: Sender,
    pub use_count: u64,
    pub created_at: Instant,
}

impl Checkout {
    pub fn fresh(sender: Sender) -> Self {
        Self {
            sender,
            use_count: 0,
            created_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct TargetCache {
    connections: Vec<IdleConnection>,
    stats: CacheStats,
}

/// Per-address idle connection cache
pub struct ConnectionCache {
    targets: Mutex<HashMap<SocketAddr, TargetCache>>,
    config: ConnectionCacheConfig,
}

impl ConnectionCache {
    pub fn new(config: ConnectionCacheConfig) -> Self {
        Self {
            targets: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Take a reusable connection for `addr`, discarding stale ones on the way
    pub fn checkout(&self, addr: SocketAddr) -> Option<Checkout> {
        let mut targets = self.targets.lock().ok()?;
        let target = targets.get_mut(&addr)?;

        while let Some(conn) = target.connections.pop() {
            if conn.is_usable(self.config.idle_timeout()) {
                target.stats.total_reused += 1;
                target.stats.idle_connections = target.connections.len();
                debug!(
                    addr = %addr,
                    use_count = conn.use_count,
                    age_secs = conn.created_at.elapsed().as_secs(),
                    "Reusing connection"
                );
                return Some(Checkout {
                    sender: conn.sender,
                    use_count: conn.use_count,
                    created_at: conn.created_at,
                });
            }
            debug!(addr = %addr, "Discarding stale connection");
        }

        target.stats.idle_connections = 0;
        None
    }

    /// Return a connection after a complete exchange
    pub fn checkin(&self, addr: SocketAddr, checkout: Checkout) {
        if checkout.sender.is_closed() {
            return;
        }
        let Ok(mut targets) = self.targets.lock() else {
            return;
        };
        let target = targets.entry(addr).or_default();

        // Only keep the connection if we're below max size
        if target.connections.len() < self.config.max_idle_per_address {
            target.connections.push(IdleConnection {
                sender: checkout.sender,
                idle_since: Instant::now(),
                use_count: checkout.use_count + 1,
                created_at: checkout.created_at,
            });
        }
        target.stats.idle_connections = target.connections.len();
    }

    pub fn record_created(&self, addr: SocketAddr) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.entry(addr).or_default().stats.total_created += 1;
        }
    }

    pub fn record_failed(&self, addr: SocketAddr) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.entry(addr).or_default().stats.failed_attempts += 1;
        }
    }

    /// Drop every cached connection and statistic for `addr`
    pub fn evict(&self, addr: SocketAddr) {
        if let Ok(mut targets) = self.targets.lock() {
            if let Some(target) = targets.remove(&addr) {
                debug!(
                    addr = %addr,
                    closed = target.connections.len(),
                    "Evicted idle connections"
                );
            }
        }
    }

    /// Statistics for one address
    pub fn stats(&self, addr: SocketAddr) -> Option<CacheStats> {
        let targets = self.targets.lock().ok()?;
        targets.get(&addr).map(|target| {
            let mut stats = target.stats.clone();
            stats.idle_connections = target.connections.len();
            stats
        })
    }
}
