use anyhow::{Context, Result};
use bytes::Bytes;
use hyper::{Request, Response};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::lb::{resolver, HealthReport, Resolve};
use crate::pool::PoolManager;
use crate::tls;
use crate::transport::HttpTransport;

/// Everything needed to talk to one logical host
///
/// Builds the resolver, TLS configuration and transport from the config, then
/// the pool (which resolves and probes once) and the dispatcher on top of it.
/// Clones share the same pool and connection cache.
#[derive(Clone)]
pub struct Core {
    pub config: Arc<ServerConfig>,
    pub resolver: Arc<dyn Resolve>,
    pub transport: Arc<HttpTransport>,
    pub pool: Arc<PoolManager>,
    dispatcher: Dispatcher,
}

impl Core {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate().context("Invalid server configuration")?;
        let config = Arc::new(config);

        let resolver: Arc<dyn Resolve> = Arc::from(resolver::from_settings(&config.resolver));

        let tls = if config.protocol.is_tls() {
            let roots = tls::root_store(&config.tls).context("Failed to load trust anchors")?;
            Some(tls::client_config(&config.hostname, roots).context("Failed to build TLS config")?)
        } else {
            None
        };

        let transport = Arc::new(
            HttpTransport::from_config(&config, tls).context("Failed to create transport")?,
        );

        let pool = Arc::new(
            PoolManager::new(&config, Arc::clone(&resolver), transport.clone())
                .await
                .with_context(|| format!("Failed to build endpoint pool for {}", config.hostname))?,
        );

        let dispatcher = Dispatcher::from_config(&config, pool.clone(), transport.clone());

        info!(
            hostname = %config.hostname,
            protocol = %config.protocol,
            port = config.port,
            "core initialized"
        );

        Ok(Self {
            config,
            resolver,
            transport,
            pool,
            dispatcher,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Resolve the hostname without touching the pool
    pub async fn resolve(&self) -> Result<Vec<IpAddr>> {
        self.resolver
            .resolve(&self.config.hostname)
            .await
            .with_context(|| format!("Failed to resolve {}", self.config.hostname))
    }

    /// GET `path` on the logical host through the dispatcher
    pub async fn get(&self, path: &str) -> Result<Response<Bytes>> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        let request = Request::get(path.as_str())
            .body(Bytes::new())
            .with_context(|| format!("Invalid request path {:?}", path))?;

        self.dispatcher
            .send(request)
            .await
            .with_context(|| format!("GET {} on {} failed", path, self.config.hostname))
    }

    pub fn check(&self) -> HealthReport {
        self.pool.check()
    }

    /// Stop the refresh task and every probe schedule
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
