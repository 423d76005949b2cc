//! Pool of endpoints for one logical hostname
//!
//! This module provides:
//! - Initial DNS resolution with a first health probe per address
//! - Periodic refresh that reconciles DNS changes into a new snapshot
//! - Reuse of surviving endpoints (same probe schedule, same health history)
//! - Disposal and connection eviction for addresses that disappear

pub mod manager;

pub use manager::{PoolError, PoolManager, PoolOptions, RefreshSummary};
