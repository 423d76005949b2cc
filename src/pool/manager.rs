use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::lb::{
    Endpoint, EndpointSource, HealthReport, ProbeContext, ProbeMode, Resolve, ResolveError,
    RoundRobinSelector,
};
use crate::transport::Transport;

/// Error types for pool construction and refresh
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Scheduling knobs for a [`PoolManager`]
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Period of the background DNS refresh, `None` to refresh only on demand
    pub refresh_period: Option<Duration>,
    /// How new endpoints keep their health current
    pub probe_mode: ProbeMode,
}

impl PoolOptions {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            refresh_period: Some(config.dns_refresh_period()),
            probe_mode: ProbeMode::Periodic(config.health_check_period()),
        }
    }
}

/// What a single refresh did to the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub kept: usize,
    pub added: usize,
    pub removed: usize,
    /// DNS returned nothing and the previous snapshot was left in place
    pub unchanged: bool,
}

struct PoolInner {
    hostname: String,
    resolver: Arc<dyn Resolve>,
    ctx: Arc<ProbeContext>,
    transport: Arc<dyn Transport>,
    probe_mode: ProbeMode,
    current: ArcSwap<RoundRobinSelector>,
    // Serializes reconciliation; readers never take it
    refresh_lock: tokio::sync::Mutex<()>,
}

impl PoolInner {
    async fn refresh(&self) -> Result<RefreshSummary, PoolError> {
        let _guard = self.refresh_lock.lock().await;

        let addrs = self.resolver.resolve(&self.hostname).await?;
        let previous = self.current.load_full();

        if addrs.is_empty() {
            warn!(
                hostname = %self.hostname,
                endpoints = previous.len(),
                "DNS returned no addresses, keeping current endpoints"
            );
            return Ok(RefreshSummary {
                kept: previous.len(),
                unchanged: true,
                ..Default::default()
            });
        }

        let existing: HashMap<IpAddr, Arc<Endpoint>> = previous
            .endpoints()
            .iter()
            .map(|endpoint| (endpoint.ip(), Arc::clone(endpoint)))
            .collect();

        // Slots keep the resolution order while new endpoints probe concurrently
        let mut slots: Vec<Option<Arc<Endpoint>>> = Vec::with_capacity(addrs.len());
        let mut starting = JoinSet::new();
        let mut summary = RefreshSummary::default();

        for (slot, ip) in addrs.iter().copied().enumerate() {
            match existing.get(&ip) {
                Some(endpoint) => {
                    slots.push(Some(Arc::clone(endpoint)));
                    summary.kept += 1;
                }
                None => {
                    slots.push(None);
                    let ctx = Arc::clone(&self.ctx);
                    let mode = self.probe_mode;
                    starting.spawn(async move { (slot, Endpoint::start(ip, ctx, mode).await) });
                }
            }
        }

        while let Some(started) = starting.join_next().await {
            match started {
                Ok((slot, endpoint)) => {
                    slots[slot] = Some(endpoint);
                    summary.added += 1;
                }
                Err(e) => warn!(hostname = %self.hostname, error = %e, "endpoint start failed"),
            }
        }

        let endpoints: Vec<Arc<Endpoint>> = slots.into_iter().flatten().collect();
        let resolved: HashSet<IpAddr> = addrs.iter().copied().collect();

        self.current.store(Arc::new(RoundRobinSelector::new(endpoints)));

        for endpoint in previous.endpoints() {
            if !resolved.contains(&endpoint.ip()) {
                endpoint.dispose();
                self.transport.evict(endpoint.addr());
                summary.removed += 1;
                info!(hostname = %self.hostname, addr = %endpoint.addr(), "endpoint removed");
            }
        }

        Ok(summary)
    }

    fn dispose_all(&self) {
        for endpoint in self.current.load().endpoints() {
            endpoint.dispose();
        }
    }
}

/// DNS-driven pool of health-checked endpoints for one hostname
///
/// The current [`RoundRobinSelector`] is published through an `ArcSwap`, so
/// `next()` never waits on a refresh: callers see either the previous
/// snapshot or the complete new one.
pub struct PoolManager {
    inner: Arc<PoolInner>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// Build a pool from configuration, resolving and probing once before returning
    pub async fn new(
        config: &ServerConfig,
        resolver: Arc<dyn Resolve>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, PoolError> {
        let ctx = Arc::new(ProbeContext::from_config(config, Arc::clone(&transport)));
        Self::with_options(
            config.hostname.clone(),
            resolver,
            ctx,
            transport,
            PoolOptions::from_config(config),
        )
        .await
    }

    /// Build a pool with explicit scheduling
    ///
    /// A resolution error here is fatal. An empty answer yields an empty pool
    /// that later refreshes may fill.
    pub async fn with_options(
        hostname: impl Into<String>,
        resolver: Arc<dyn Resolve>,
        ctx: Arc<ProbeContext>,
        transport: Arc<dyn Transport>,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        let inner = Arc::new(PoolInner {
            hostname: hostname.into(),
            resolver,
            ctx,
            transport,
            probe_mode: options.probe_mode,
            current: ArcSwap::from_pointee(RoundRobinSelector::empty()),
            refresh_lock: tokio::sync::Mutex::new(()),
        });

        let summary = inner.refresh().await?;
        info!(
            hostname = %inner.hostname,
            endpoints = summary.added,
            healthy = inner.current.load().healthy_count(),
            "pool initialized"
        );

        let refresh_task = options
            .refresh_period
            .map(|period| Self::spawn_refresh(Arc::clone(&inner), period));

        Ok(Self {
            inner,
            refresh_task: Mutex::new(refresh_task),
        })
    }

    fn spawn_refresh(inner: Arc<PoolInner>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Construction already ran the first reconciliation
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match inner.refresh().await {
                    Ok(summary) if summary.added > 0 || summary.removed > 0 => info!(
                        hostname = %inner.hostname,
                        kept = summary.kept,
                        added = summary.added,
                        removed = summary.removed,
                        "pool refreshed"
                    ),
                    Ok(summary) => debug!(
                        hostname = %inner.hostname,
                        kept = summary.kept,
                        "pool refreshed, no changes"
                    ),
                    Err(e) => warn!(
                        hostname = %inner.hostname,
                        error = %e,
                        "DNS refresh failed, keeping current endpoints"
                    ),
                }
            }
        })
    }

    pub fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    /// Resolve again and reconcile the snapshot now
    pub async fn refresh(&self) -> Result<RefreshSummary, PoolError> {
        self.inner.refresh().await
    }

    /// Currently published snapshot
    pub fn snapshot(&self) -> Arc<RoundRobinSelector> {
        self.inner.current.load_full()
    }

    /// Next healthy endpoint, `None` when nothing is healthy right now
    pub fn next(&self) -> Option<Arc<Endpoint>> {
        self.inner.current.load().next()
    }

    /// Aggregate health of the current snapshot
    pub fn check(&self) -> HealthReport {
        HealthReport::from_endpoints(self.inner.current.load().endpoints())
    }

    /// Stop refreshing and cancel every endpoint's probe schedule
    pub fn shutdown(&self) {
        if let Ok(mut task) = self.refresh_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        self.inner.dispose_all();
        debug!(hostname = %self.inner.hostname, "pool shut down");
    }
}

impl EndpointSource for PoolManager {
    fn next_endpoint(&self) -> Option<Arc<Endpoint>> {
        self.next()
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
