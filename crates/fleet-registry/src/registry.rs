//! In-memory service registry

use crate::instance::ServiceInstance;
use crate::strategy::SelectionStrategy;
use chrono::Utc;
use fleet_core::{Error, InstanceState, Result};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Registry of live backend instances, keyed by service name.
///
/// All mutation happens under the registry's own lock, held briefly; no
/// network I/O is ever performed while holding it. Returned instances are
/// copies, never aliases into internal storage.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    round_robin: Mutex<HashMap<String, usize>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance, returning its id.
    ///
    /// If an instance with the same `(service, host, port)` already exists
    /// it is updated in place rather than duplicated. New entries enter the
    /// `Starting` state.
    pub fn register(&self, mut instance: ServiceInstance) -> String {
        if instance.id.is_empty() {
            instance.id = instance.synthesize_id();
        }
        let now = Utc::now();
        instance.registered_at = now;
        instance.last_check = now;
        instance.status = InstanceState::Starting;
        instance.fail_count = 0;

        let id = instance.id.clone();
        let mut services = self.services.write();
        let bucket = services.entry(instance.name.clone()).or_default();

        if let Some(existing) = bucket
            .iter_mut()
            .find(|e| e.host == instance.host && e.port == instance.port)
        {
            info!(
                service = %instance.name,
                endpoint = %instance.endpoint(),
                "Updated existing service instance"
            );
            *existing = instance;
        } else {
            info!(
                service = %instance.name,
                endpoint = %instance.endpoint(),
                "Registered service instance"
            );
            bucket.push(instance);
        }

        id
    }

    /// Remove an instance; empty service buckets are pruned.
    pub fn deregister(&self, service: &str, instance_id: &str) -> Result<()> {
        let mut services = self.services.write();
        let bucket = services
            .get_mut(service)
            .ok_or_else(|| Error::not_found(format!("service {} not found", service)))?;

        let before = bucket.len();
        bucket.retain(|i| i.id != instance_id);
        if bucket.len() == before {
            return Err(Error::not_found(format!(
                "instance {}/{} not found",
                service, instance_id
            )));
        }

        if bucket.is_empty() {
            services.remove(service);
        }

        info!(service = %service, instance = %instance_id, "Deregistered service instance");
        Ok(())
    }

    /// All healthy instances of a service, as copies.
    pub fn discover(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        let services = self.services.read();
        let bucket = services
            .get(service)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::not_found(format!("service {} not found", service)))?;

        let healthy: Vec<ServiceInstance> = bucket
            .iter()
            .filter(|i| i.status.is_routable())
            .cloned()
            .collect();

        if healthy.is_empty() {
            return Err(Error::unavailable(format!(
                "no healthy instances for {}",
                service
            )));
        }

        debug!(service = %service, count = healthy.len(), "Discovered service instances");
        Ok(healthy)
    }

    /// Choose one healthy instance of a service.
    pub fn pick(&self, service: &str, strategy: SelectionStrategy) -> Result<ServiceInstance> {
        let healthy = self.discover(service)?;

        let selected = match strategy {
            SelectionStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..healthy.len());
                healthy[index].clone()
            }
            SelectionStrategy::RoundRobin => {
                let mut counters = self.round_robin.lock();
                let counter = counters.entry(service.to_string()).or_insert(0);
                let index = *counter % healthy.len();
                *counter = counter.wrapping_add(1);
                healthy[index].clone()
            }
            SelectionStrategy::LeastConnections => healthy
                .iter()
                .min_by_key(|i| i.inflight)
                .cloned()
                .expect("healthy list is non-empty"),
        };

        debug!(
            service = %service,
            instance = %selected.id,
            strategy = %strategy,
            "Selected instance"
        );
        Ok(selected)
    }

    /// Look up an instance by id.
    pub fn get(&self, service: &str, instance_id: &str) -> Option<ServiceInstance> {
        self.services
            .read()
            .get(service)
            .and_then(|b| b.iter().find(|i| i.id == instance_id))
            .cloned()
    }

    /// First live instance of a service regardless of health, if any.
    pub fn find_live(&self, service: &str) -> Option<ServiceInstance> {
        self.services
            .read()
            .get(service)
            .and_then(|b| b.iter().find(|i| i.status.is_live()))
            .cloned()
    }

    /// Snapshot of every registered service.
    pub fn all_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.services.read().clone()
    }

    /// Mark an instance healthy, resetting its failure count.
    ///
    /// Returns `true` if this was a recovery (the instance was not healthy
    /// before).
    pub fn mark_healthy(&self, service: &str, instance_id: &str) -> bool {
        let mut services = self.services.write();
        if let Some(instance) = find_mut(&mut services, service, instance_id) {
            let recovered = instance.status != InstanceState::Healthy;
            instance.status = InstanceState::Healthy;
            instance.fail_count = 0;
            instance.last_check = Utc::now();
            recovered
        } else {
            false
        }
    }

    /// Record a probe failure; demote to `Unhealthy` once `threshold`
    /// consecutive failures accumulate.
    ///
    /// Returns `Some(true)` exactly when this call crossed the threshold
    /// edge, so the caller can log the demotion once. Instances that are no
    /// longer probeable are left untouched.
    pub fn mark_probe_failure(
        &self,
        service: &str,
        instance_id: &str,
        threshold: u32,
    ) -> Option<bool> {
        let mut services = self.services.write();
        let instance = find_mut(&mut services, service, instance_id)?;
        if !instance.status.is_probeable() {
            return None;
        }

        instance.fail_count += 1;
        instance.last_check = Utc::now();

        if instance.fail_count >= threshold && instance.status != InstanceState::Unhealthy {
            instance.status = InstanceState::Unhealthy;
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Demote an instance immediately, bypassing the probe threshold.
    /// Used when a forwarded request hits a transport error.
    pub fn force_unhealthy(&self, service: &str, instance_id: &str) {
        let mut services = self.services.write();
        if let Some(instance) = find_mut(&mut services, service, instance_id) {
            if instance.status.is_live() && instance.status != InstanceState::Unhealthy {
                warn!(
                    service = %service,
                    instance = %instance_id,
                    "Instance demoted after transport failure"
                );
                instance.status = InstanceState::Unhealthy;
                instance.fail_count += 1;
                instance.last_check = Utc::now();
            }
        }
    }

    /// Move an instance into the given lifecycle state. The supervisor uses
    /// this for `Stopping`/`Stopped`/`Failed` transitions it owns.
    pub fn set_state(&self, service: &str, instance_id: &str, state: InstanceState) {
        let mut services = self.services.write();
        if let Some(instance) = find_mut(&mut services, service, instance_id) {
            instance.status = state;
            instance.last_check = Utc::now();
        }
    }

    /// Record a dispatch to an instance.
    pub fn touch_used(&self, service: &str, instance_id: &str) {
        let mut services = self.services.write();
        if let Some(instance) = find_mut(&mut services, service, instance_id) {
            instance.usage_count += 1;
            instance.last_used = Utc::now();
        }
    }

    /// Begin tracking an in-flight request against an instance. The guard
    /// decrements the counter when dropped.
    pub fn begin_request(&self, service: &str, instance_id: &str) -> InflightGuard<'_> {
        {
            let mut services = self.services.write();
            if let Some(instance) = find_mut(&mut services, service, instance_id) {
                instance.inflight += 1;
            }
        }
        InflightGuard {
            registry: self,
            service: service.to_string(),
            instance_id: instance_id.to_string(),
        }
    }

    /// Aggregated registry statistics.
    pub fn stats(&self) -> RegistryStats {
        let services = self.services.read();
        let mut stats = RegistryStats {
            total_services: services.len(),
            ..Default::default()
        };

        for (name, bucket) in services.iter() {
            let mut health = ServiceHealth {
                total: bucket.len(),
                ..Default::default()
            };
            for instance in bucket {
                stats.total_instances += 1;
                match instance.status {
                    InstanceState::Healthy => {
                        health.healthy += 1;
                        stats.healthy_instances += 1;
                    }
                    InstanceState::Starting => health.starting += 1,
                    _ => health.unhealthy += 1,
                }
            }
            stats.services.insert(name.clone(), health);
        }

        stats.unhealthy_instances = stats.total_instances - stats.healthy_instances;
        stats
    }
}

fn find_mut<'a>(
    services: &'a mut HashMap<String, Vec<ServiceInstance>>,
    service: &str,
    instance_id: &str,
) -> Option<&'a mut ServiceInstance> {
    services
        .get_mut(service)
        .and_then(|b| b.iter_mut().find(|i| i.id == instance_id))
}

/// Decrements an instance's in-flight counter on drop.
pub struct InflightGuard<'a> {
    registry: &'a ServiceRegistry,
    service: String,
    instance_id: String,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut services = self.registry.services.write();
        if let Some(instance) = find_mut(&mut services, &self.service, &self.instance_id) {
            instance.inflight = instance.inflight.saturating_sub(1);
        }
    }
}

/// Aggregated view of registry health.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub services: HashMap<String, ServiceHealth>,
}

/// Per-service instance counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceHealth {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub starting: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    fn register_instance(registry: &ServiceRegistry, service: &str, port: u16) -> String {
        registry.register(ServiceInstance::new(
            service,
            "127.0.0.1",
            port,
            StdHashMap::new(),
        ))
    }

    fn register_healthy(registry: &ServiceRegistry, service: &str, port: u16) -> String {
        let id = register_instance(registry, service, port);
        registry.mark_healthy(service, &id);
        id
    }

    #[test]
    fn test_register_and_discover() {
        let registry = ServiceRegistry::new();
        let id = register_instance(&registry, "llm-model-m1", 8081);

        // still Starting, so discovery has nothing to hand out
        assert!(registry.discover("llm-model-m1").is_err());

        registry.mark_healthy("llm-model-m1", &id);
        let instances = registry.discover("llm-model-m1").unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].port, 8081);
    }

    #[test]
    fn test_register_updates_in_place() {
        let registry = ServiceRegistry::new();
        register_instance(&registry, "llm-model-m1", 8081);
        register_instance(&registry, "llm-model-m1", 8081);

        let services = registry.all_services();
        assert_eq!(services["llm-model-m1"].len(), 1);
    }

    #[test]
    fn test_deregister_prunes_empty_service() {
        let registry = ServiceRegistry::new();
        let id = register_instance(&registry, "llm-model-m1", 8081);

        registry.deregister("llm-model-m1", &id).unwrap();
        assert!(registry.all_services().is_empty());

        // second deregister is an error, not a panic
        assert!(registry.deregister("llm-model-m1", &id).is_err());
    }

    #[test]
    fn test_discover_unknown_service() {
        let registry = ServiceRegistry::new();
        let err = registry.discover("llm-model-ghost").unwrap_err();
        assert_eq!(err.to_http_status(), 404);
    }

    #[test]
    fn test_discover_no_healthy() {
        let registry = ServiceRegistry::new();
        let id = register_instance(&registry, "llm-model-m1", 8081);
        registry.mark_healthy("llm-model-m1", &id);
        registry.force_unhealthy("llm-model-m1", &id);

        let err = registry.discover("llm-model-m1").unwrap_err();
        assert_eq!(err.to_http_status(), 503);
    }

    #[test]
    fn test_round_robin_fairness() {
        let registry = ServiceRegistry::new();
        for port in [8081, 8082, 8083] {
            register_healthy(&registry, "llm-model-m1", port);
        }

        let mut counts: StdHashMap<u16, usize> = StdHashMap::new();
        for _ in 0..9 {
            let picked = registry
                .pick("llm-model-m1", SelectionStrategy::RoundRobin)
                .unwrap();
            *counts.entry(picked.port).or_insert(0) += 1;
        }

        // 9 picks over 3 instances with stable membership: 3 each
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert_eq!(*count, 3);
        }
    }

    #[test]
    fn test_least_connections_prefers_idle() {
        let registry = Arc::new(ServiceRegistry::new());
        let busy = register_healthy(&registry, "llm-model-m1", 8081);
        let idle = register_healthy(&registry, "llm-model-m1", 8082);

        let _guard_a = registry.begin_request("llm-model-m1", &busy);
        let _guard_b = registry.begin_request("llm-model-m1", &busy);

        let picked = registry
            .pick("llm-model-m1", SelectionStrategy::LeastConnections)
            .unwrap();
        assert_eq!(picked.id, idle);
    }

    #[test]
    fn test_inflight_guard_decrements_on_drop() {
        let registry = Arc::new(ServiceRegistry::new());
        let id = register_healthy(&registry, "llm-model-m1", 8081);

        {
            let _guard = registry.begin_request("llm-model-m1", &id);
            assert_eq!(registry.get("llm-model-m1", &id).unwrap().inflight, 1);
        }
        assert_eq!(registry.get("llm-model-m1", &id).unwrap().inflight, 0);
    }

    #[test]
    fn test_probe_failure_threshold() {
        let registry = ServiceRegistry::new();
        let id = register_healthy(&registry, "llm-model-m1", 8081);

        assert_eq!(registry.mark_probe_failure("llm-model-m1", &id, 3), Some(false));
        assert_eq!(registry.mark_probe_failure("llm-model-m1", &id, 3), Some(false));
        // third failure crosses the edge exactly once
        assert_eq!(registry.mark_probe_failure("llm-model-m1", &id, 3), Some(true));
        assert_eq!(registry.mark_probe_failure("llm-model-m1", &id, 3), Some(false));

        let instance = registry.get("llm-model-m1", &id).unwrap();
        assert_eq!(instance.status, InstanceState::Unhealthy);
        assert_eq!(instance.fail_count, 4);
    }

    #[test]
    fn test_recovery_resets_failures() {
        let registry = ServiceRegistry::new();
        let id = register_healthy(&registry, "llm-model-m1", 8081);
        for _ in 0..3 {
            registry.mark_probe_failure("llm-model-m1", &id, 3);
        }
        assert_eq!(
            registry.get("llm-model-m1", &id).unwrap().status,
            InstanceState::Unhealthy
        );

        let recovered = registry.mark_healthy("llm-model-m1", &id);
        assert!(recovered);
        let instance = registry.get("llm-model-m1", &id).unwrap();
        assert_eq!(instance.status, InstanceState::Healthy);
        assert_eq!(instance.fail_count, 0);

        // marking healthy again is not a recovery
        assert!(!registry.mark_healthy("llm-model-m1", &id));
    }

    #[test]
    fn test_probe_failure_ignores_stopping_instance() {
        let registry = ServiceRegistry::new();
        let id = register_healthy(&registry, "llm-model-m1", 8081);
        registry.set_state("llm-model-m1", &id, InstanceState::Stopping);

        assert_eq!(registry.mark_probe_failure("llm-model-m1", &id, 3), None);
    }

    #[test]
    fn test_touch_used() {
        let registry = ServiceRegistry::new();
        let id = register_healthy(&registry, "llm-model-m1", 8081);
        registry.touch_used("llm-model-m1", &id);
        registry.touch_used("llm-model-m1", &id);
        assert_eq!(registry.get("llm-model-m1", &id).unwrap().usage_count, 2);
    }

    #[test]
    fn test_stats() {
        let registry = ServiceRegistry::new();
        register_healthy(&registry, "llm-model-m1", 8081);
        register_instance(&registry, "llm-model-m2", 8082);
        let down = register_healthy(&registry, "llm-model-m2", 8083);
        registry.force_unhealthy("llm-model-m2", &down);

        let stats = registry.stats();
        assert_eq!(stats.total_services, 2);
        assert_eq!(stats.total_instances, 3);
        assert_eq!(stats.healthy_instances, 1);
        assert_eq!(stats.unhealthy_instances, 2);
        assert_eq!(stats.services["llm-model-m2"].starting, 1);
        assert_eq!(stats.services["llm-model-m2"].unhealthy, 1);
    }

    #[test]
    fn test_pick_random_only_returns_healthy() {
        let registry = ServiceRegistry::new();
        let healthy = register_healthy(&registry, "llm-model-m1", 8081);
        register_instance(&registry, "llm-model-m1", 8082); // still starting

        for _ in 0..20 {
            let picked = registry
                .pick("llm-model-m1", SelectionStrategy::Random)
                .unwrap();
            assert_eq!(picked.id, healthy);
        }
    }
}
