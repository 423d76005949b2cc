//! Endpoint discovery, health probing and round-robin selection
//!
//! # Components
//!
//! - [`Resolve`]: turns the logical hostname into a list of IP addresses
//! - [`Endpoint`]: one resolved address with its own periodic health probe
//! - [`RoundRobinSelector`]: immutable shuffled snapshot of endpoints that
//!   hands out the next healthy one on each call
//!
//! # Health
//!
//! An endpoint is healthy when a GET of its health URI (sent to the raw IP
//! but with the logical `Host` header and TLS name) answers with a status in
//! `200..=499`. Any transport failure, a read timeout or a 5xx marks it
//! unhealthy. Endpoints start unhealthy and are probed once before they are
//! handed to a selector.
//!
//! # Thread Safety
//!
//! Health flags are atomics written only by the endpoint's own probe task.
//! The selector cursor is an `AtomicUsize`, so `next()` never takes a lock.

pub mod endpoint;
pub mod health;
pub mod resolver;
pub mod selector;

pub use endpoint::{Endpoint, ProbeMode};
pub use health::{
    is_healthy_status, EndpointHealth, HealthReport, HealthState, HealthStatus, ProbeContext,
    ProbeOutcome,
};
pub use resolver::{HickoryResolver, Resolve, ResolveError, StaticResolver, SystemResolver};
pub use selector::{EndpointSource, RoundRobinSelector};
