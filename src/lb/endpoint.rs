use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::health::{HealthState, ProbeContext};

/// How an endpoint keeps its health flag current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Probe once at creation, never again
    Once,
    /// Probe at creation, then at this fixed rate
    Periodic(Duration),
}

/// One resolved address of the logical host
///
/// The health flag is written only by the endpoint's own probe task and read
/// by any number of selectors. Disposing (or dropping) the endpoint aborts
/// that task.
#[derive(Debug)]
pub struct Endpoint {
    ip: IpAddr,
    addr: SocketAddr,
    health_uri: Option<String>,
    state: Arc<HealthState>,
    schedule: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Create an endpoint for `ip`, run its first probe, then start its schedule
    ///
    /// The returned endpoint always has a defined health state.
    pub async fn start(ip: IpAddr, ctx: Arc<ProbeContext>, mode: ProbeMode) -> Arc<Self> {
        let addr = ctx.socket_addr(ip);
        let state = Arc::new(HealthState::default());

        let outcome = ctx.probe(ip).await;
        state.record(addr, &outcome);

        let schedule = match mode {
            ProbeMode::Once => None,
            ProbeMode::Periodic(interval) => {
                Some(Self::spawn_schedule(ip, addr, interval, Arc::clone(&ctx), Arc::clone(&state)))
            }
        };

        Arc::new(Self {
            ip,
            addr,
            health_uri: Some(ctx.health_uri(ip)),
            state,
            schedule: Mutex::new(schedule),
        })
    }

    /// Endpoint with a fixed health flag and no probe schedule
    ///
    /// Used when selectors are assembled by hand rather than by a pool.
    pub fn unscheduled(addr: SocketAddr, healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            ip: addr.ip(),
            addr,
            health_uri: None,
            state: Arc::new(HealthState::with_health(healthy)),
            schedule: Mutex::new(None),
        })
    }

    fn spawn_schedule(
        ip: IpAddr,
        addr: SocketAddr,
        interval: Duration,
        ctx: Arc<ProbeContext>,
        state: Arc<HealthState>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // The first probe already ran inline
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let outcome = ctx.probe(ip).await;
                state.record(addr, &outcome);
            }
        })
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `protocol://ip:port/healthPath`, absent for unscheduled endpoints
    pub fn health_uri(&self) -> Option<&str> {
        self.health_uri.as_deref()
    }

    pub fn is_healthy(&self) -> bool {
        self.state.is_healthy()
    }

    /// Override the health flag (unscheduled endpoints only have this writer)
    pub fn set_healthy(&self, healthy: bool) {
        self.state.set_healthy(healthy);
    }

    /// Whether at least one probe has completed
    pub fn is_probed(&self) -> bool {
        self.state.is_probed()
    }

    pub fn time_since_last_check(&self) -> Option<Duration> {
        self.state.time_since_last_check()
    }

    /// Whether a probe schedule is still running
    pub fn is_scheduled(&self) -> bool {
        self.schedule
            .lock()
            .map(|schedule| schedule.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Cancel the probe schedule; the health flag keeps its last value
    pub fn dispose(&self) {
        if let Ok(mut schedule) = self.schedule.lock() {
            if let Some(handle) = schedule.take() {
                handle.abort();
                debug!(addr = %self.addr, "endpoint probe schedule cancelled");
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.dispose();
    }
}
