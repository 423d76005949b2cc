//! Hostname resolution
//!
//! Every resolver returns addresses in the order the underlying source
//! produced them, with duplicates collapsed to their first occurrence. An
//! empty list is a valid answer ("no addresses") and is never turned into an
//! error here; callers decide what an empty answer means for them.

use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

use crate::config::ResolverSettings;

/// Errors that can occur during hostname resolution
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to resolve {hostname}: {source}")]
    Lookup {
        hostname: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Turns a hostname into an ordered list of distinct IP addresses
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Collapse duplicates while keeping the first occurrence of each address
pub fn dedup_ordered<I: IntoIterator<Item = IpAddr>>(addrs: I) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    addrs.into_iter().filter(|ip| seen.insert(*ip)).collect()
}

/// Resolver backed by the operating system (getaddrinfo)
#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolve for SystemResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolveError> {
        // The port is irrelevant; lookup_host wants a socket address form
        let addrs = tokio::net::lookup_host((hostname, 0))
            .await
            .map_err(|e| ResolveError::Lookup {
                hostname: hostname.to_string(),
                source: Box::new(e),
            })?;

        let ips = dedup_ordered(addrs.map(|addr| addr.ip()));
        debug!(hostname = %hostname, count = ips.len(), "system resolver answered");
        Ok(ips)
    }
}

/// Resolver backed by hickory with an explicit cache TTL ceiling
pub struct HickoryResolver {
    resolver: Resolver<TokioConnectionProvider>,
}

impl HickoryResolver {
    /// Build a resolver; `cache_ttl` caps how long positive answers are cached
    pub fn new(cache_ttl: Option<Duration>) -> Self {
        let mut builder = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        );
        if let Some(ttl) = cache_ttl {
            builder.options_mut().positive_max_ttl = Some(ttl);
        }

        Self {
            resolver: builder.build(),
        }
    }
}

#[async_trait]
impl Resolve for HickoryResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let lookup = self
            .resolver
            .lookup_ip(hostname)
            .await
            .map_err(|e| ResolveError::Lookup {
                hostname: hostname.to_string(),
                source: Box::new(e),
            })?;

        let ips = dedup_ordered(lookup.iter());
        debug!(hostname = %hostname, count = ips.len(), "hickory resolver answered");
        Ok(ips)
    }
}

/// Resolver with a fixed answer that can be replaced at runtime
#[derive(Debug, Default)]
pub struct StaticResolver {
    addresses: RwLock<Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new(addresses: Vec<IpAddr>) -> Self {
        Self {
            addresses: RwLock::new(dedup_ordered(addresses)),
        }
    }

    /// Replace the answer returned by subsequent lookups
    pub fn set(&self, addresses: Vec<IpAddr>) {
        if let Ok(mut current) = self.addresses.write() {
            *current = dedup_ordered(addresses);
        }
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, _hostname: &str) -> Result<Vec<IpAddr>, ResolveError> {
        Ok(self
            .addresses
            .read()
            .map(|addrs| addrs.clone())
            .unwrap_or_default())
    }
}

/// Build the resolver described by the configuration
pub fn from_settings(settings: &ResolverSettings) -> Box<dyn Resolve> {
    match settings {
        ResolverSettings::System => Box::new(SystemResolver),
        ResolverSettings::Hickory { cache_ttl_secs } => {
            Box::new(HickoryResolver::new(cache_ttl_secs.map(Duration::from_secs)))
        }
        ResolverSettings::Static { addresses } => Box::new(StaticResolver::new(addresses.clone())),
    }
}
