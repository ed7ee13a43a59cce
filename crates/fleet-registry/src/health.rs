//! Periodic health probing of registered instances

use crate::registry::ServiceRegistry;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default seconds between probe sweeps.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Default per-probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failures before an instance is demoted.
pub const DEFAULT_FAIL_THRESHOLD: u32 = 3;

type ProbeClient = Client<HttpConnector, Full<Bytes>>;

/// Probes every registered instance on an interval and owns the resulting
/// health transitions.
///
/// Probes run concurrently per instance; the registry lock is only taken
/// for the state flip, never across the probe itself. Instances in
/// `Stopping`/`Stopped`/`Failed` are skipped; `Unhealthy` instances keep
/// being probed so they can recover.
pub struct HealthProber {
    registry: Arc<ServiceRegistry>,
    client: ProbeClient,
    interval: Duration,
    probe_timeout: Duration,
    fail_threshold: u32,
}

impl HealthProber {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            client: Client::builder(TokioExecutor::new()).build_http(),
            interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            fail_threshold: DEFAULT_FAIL_THRESHOLD,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn with_fail_threshold(mut self, threshold: u32) -> Self {
        self.fail_threshold = threshold;
        self
    }

    /// Start the probe loop as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }

    /// Probe every probeable instance once, concurrently.
    pub async fn sweep(&self) {
        let targets: Vec<(String, String, String, u16)> = self
            .registry
            .all_services()
            .into_iter()
            .flat_map(|(service, instances)| {
                instances
                    .into_iter()
                    .filter(|i| i.status.is_probeable())
                    .map(move |i| (service.clone(), i.id, i.host, i.port))
            })
            .collect();

        let mut probes = JoinSet::new();
        for (service, id, host, port) in targets {
            probes.spawn(probe_target(
                self.client.clone(),
                Arc::clone(&self.registry),
                self.probe_timeout,
                self.fail_threshold,
                service,
                id,
                host,
                port,
            ));
        }
        while probes.join_next().await.is_some() {}
    }
}

/// Probe one instance and apply the resulting transition.
async fn probe_target(
    client: ProbeClient,
    registry: Arc<ServiceRegistry>,
    probe_timeout: Duration,
    fail_threshold: u32,
    service: String,
    instance_id: String,
    host: String,
    port: u16,
) {
    if check(&client, probe_timeout, &host, port).await {
        if registry.mark_healthy(&service, &instance_id) {
            info!(
                service = %service,
                instance = %instance_id,
                "Instance recovered, marked healthy"
            );
        }
    } else if let Some(crossed) = registry.mark_probe_failure(&service, &instance_id, fail_threshold)
    {
        if crossed {
            warn!(
                service = %service,
                instance = %instance_id,
                threshold = fail_threshold,
                "Instance marked unhealthy after consecutive probe failures"
            );
        } else {
            debug!(service = %service, instance = %instance_id, "Health probe failed");
        }
    }
}

/// Issue one `GET /health` probe.
async fn check(client: &ProbeClient, probe_timeout: Duration, host: &str, port: u16) -> bool {
    let uri: Uri = match format!("http://{}:{}/health", host, port).parse() {
        Ok(uri) => uri,
        Err(_) => return false,
    };

    let request = match Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Full::new(Bytes::new()))
    {
        Ok(request) => request,
        Err(_) => return false,
    };

    match timeout(probe_timeout, client.request(request)).await {
        Ok(Ok(response)) => response.status().is_success(),
        Ok(Err(_)) | Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ServiceInstance;
    use fleet_core::InstanceState;
    use std::collections::HashMap;

    fn registry_with_instance(state: InstanceState) -> (Arc<ServiceRegistry>, String) {
        let registry = Arc::new(ServiceRegistry::new());
        let id = registry.register(ServiceInstance::new(
            "llm-model-m1",
            "127.0.0.1",
            1, // port 1: nothing listens there
            HashMap::new(),
        ));
        registry.set_state("llm-model-m1", &id, state);
        (registry, id)
    }

    #[tokio::test]
    async fn test_sweep_demotes_after_threshold() {
        let (registry, id) = registry_with_instance(InstanceState::Healthy);
        let prober = HealthProber::new(Arc::clone(&registry))
            .with_probe_timeout(Duration::from_millis(200))
            .with_fail_threshold(3);

        prober.sweep().await;
        prober.sweep().await;
        assert_eq!(
            registry.get("llm-model-m1", &id).unwrap().status,
            InstanceState::Healthy
        );

        prober.sweep().await;
        assert_eq!(
            registry.get("llm-model-m1", &id).unwrap().status,
            InstanceState::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_sweep_keeps_probing_unhealthy() {
        let (registry, id) = registry_with_instance(InstanceState::Unhealthy);
        let prober = HealthProber::new(Arc::clone(&registry))
            .with_probe_timeout(Duration::from_millis(200));

        prober.sweep().await;
        // still probed: fail_count advances
        assert!(registry.get("llm-model-m1", &id).unwrap().fail_count > 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_stopping_instances() {
        let (registry, id) = registry_with_instance(InstanceState::Stopping);
        let prober = HealthProber::new(Arc::clone(&registry))
            .with_probe_timeout(Duration::from_millis(200));

        prober.sweep().await;
        let instance = registry.get("llm-model-m1", &id).unwrap();
        assert_eq!(instance.status, InstanceState::Stopping);
        assert_eq!(instance.fail_count, 0);
    }
}
