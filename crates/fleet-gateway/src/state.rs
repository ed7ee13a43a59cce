//! Shared application state

use crate::dispatch::Dispatcher;
use crate::logs::LogStore;
use crate::metrics::MetricsCollector;
use crate::proxy::ProxyCache;
use crate::quota::{InMemoryCallRecorder, InMemoryUserStore, QuotaGate};
use crate::ratelimit::RateLimiters;
use chrono::{DateTime, Utc};
use fleet_cluster::ClusterManager;
use fleet_core::{CatalogHandle, Config, Result};
use fleet_registry::{HealthProber, ServiceRegistry};
use fleet_supervisor::{Supervisor, SupervisorConfig};
use std::sync::Arc;
use uuid::Uuid;

/// Everything the handlers need, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<CatalogHandle>,
    pub registry: Arc<ServiceRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub dispatcher: Arc<Dispatcher>,
    pub cluster: Arc<ClusterManager>,
    pub limiters: Arc<RateLimiters>,
    pub quota: Arc<QuotaGate>,
    pub proxy: Arc<ProxyCache>,
    pub metrics: Arc<MetricsCollector>,
    pub logs: Arc<LogStore>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Build the full state from configuration, loading the catalog from
    /// disk. A missing or unparsable catalog file is fatal here.
    pub fn new(config: Config) -> Result<Self> {
        let catalog = Arc::new(CatalogHandle::load(&config.model_config_path)?);
        Ok(Self::with_catalog(config, catalog))
    }

    /// Build the state around an already-loaded catalog.
    pub fn with_catalog(config: Config, catalog: Arc<CatalogHandle>) -> Self {
        let registry = Arc::new(ServiceRegistry::new());
        let supervisor = Arc::new(Supervisor::new(
            SupervisorConfig::from_node_config(&config),
            Arc::clone(&catalog),
            Arc::clone(&registry),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&supervisor),
            Arc::clone(&registry),
        ));
        let cluster = Arc::new(ClusterManager::new(
            Uuid::new_v4().to_string(),
            "127.0.0.1",
            config.server_port,
        ));

        let users = Arc::new(InMemoryUserStore::new(config.default_tokens));
        let recorder = Arc::new(InMemoryCallRecorder::new());
        let quota = Arc::new(QuotaGate::new(users, recorder));

        Self {
            catalog,
            registry: Arc::clone(&registry),
            supervisor,
            dispatcher,
            cluster,
            limiters: Arc::new(RateLimiters::new()),
            quota,
            proxy: Arc::new(ProxyCache::new(registry)),
            metrics: Arc::new(MetricsCollector::new()),
            logs: Arc::new(LogStore::default()),
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }

    /// Start every long-lived background task: health probing, cluster
    /// heartbeats and sweeps, and the limiter/proxy janitors.
    pub fn spawn_background(&self) {
        HealthProber::new(Arc::clone(&self.registry)).spawn();
        Arc::clone(&self.cluster).spawn_background();
        Arc::clone(&self.limiters).spawn_janitor();
        Arc::clone(&self.proxy).spawn_janitor();
    }
}
