use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::endpoint::Endpoint;

/// Anything able to hand out the next endpoint for a request
pub trait EndpointSource: Send + Sync {
    /// Next healthy endpoint, or `None` when nothing is healthy right now
    fn next_endpoint(&self) -> Option<Arc<Endpoint>>;
}

/// Immutable snapshot of endpoints with a shared round-robin cursor
///
/// Membership never changes after construction. Health is re-read on every
/// call so unhealthy members are skipped without rebuilding the snapshot.
#[derive(Debug)]
pub struct RoundRobinSelector {
    endpoints: Vec<Arc<Endpoint>>,
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    /// Shuffle `endpoints` and start the cursor before the first element
    pub fn new(mut endpoints: Vec<Arc<Endpoint>>) -> Self {
        endpoints.shuffle(&mut rand::thread_rng());
        Self::with_order(endpoints)
    }

    /// Keep the given order as is
    pub fn with_order(endpoints: Vec<Arc<Endpoint>>) -> Self {
        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::with_order(Vec::new())
    }

    /// Next healthy endpoint in round-robin order
    ///
    /// Every call consumes exactly one cursor increment, even when the
    /// healthy subset changes between calls.
    pub fn next(&self) -> Option<Arc<Endpoint>> {
        let healthy: Vec<&Arc<Endpoint>> =
            self.endpoints.iter().filter(|e| e.is_healthy()).collect();
        if healthy.is_empty() {
            return None;
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(Arc::clone(healthy[index]))
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| e.is_healthy()).count()
    }
}

impl EndpointSource for RoundRobinSelector {
    fn next_endpoint(&self) -> Option<Arc<Endpoint>> {
        self.next()
    }
}
