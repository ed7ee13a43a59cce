//! Per-model process lifecycle
//!
//! One supervisor per node enforces at most one running backend per model.
//! `ensure` is the entry point: it either finds a live instance or spawns a
//! new child, registers it, and hands cleanup to a monitor task. The
//! monitor is the only place that releases the port and deregisters the
//! instance, so those happen exactly once no matter how the process dies.

use crate::backend::BackendClient;
use crate::ports::PortPool;
use chrono::{DateTime, Utc};
use fleet_core::catalog::{
    CatalogHandle, ModelSpec, DEFAULT_REPEAT_PENALTY, DEFAULT_TEMPERATURE, DEFAULT_TOP_P,
};
use fleet_core::{service_name, Error, InstanceState, Result};
use fleet_registry::{ServiceInstance, ServiceRegistry};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the llama.cpp server binary
    pub llama_cpp_path: String,

    /// Address backends bind; also the address they are probed on
    pub bind_host: String,

    /// First port handed to backends
    pub port_range_start: u16,

    /// Last port handed to backends (inclusive)
    pub port_range_end: u16,

    /// How long a backend may take to answer its first health probe
    pub startup_timeout: Duration,

    /// Delay between readiness polls
    pub readiness_poll: Duration,

    /// Bound on waiting for an already-starting instance in `ensure`
    pub ready_wait: Duration,

    /// Grace period between SIGTERM and SIGKILL on stop
    pub stop_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            llama_cpp_path: "llama-server".to_string(),
            bind_host: "127.0.0.1".to_string(),
            port_range_start: 8081,
            port_range_end: 8090,
            startup_timeout: Duration::from_secs(120),
            readiness_poll: Duration::from_millis(250),
            ready_wait: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl SupervisorConfig {
    /// Derive the supervisor configuration from the node config.
    pub fn from_node_config(config: &fleet_core::Config) -> Self {
        Self {
            llama_cpp_path: config.llama_cpp_path.clone(),
            port_range_start: config.llama_cpp_port,
            port_range_end: config.llama_cpp_port.saturating_add(9),
            ..Self::default()
        }
    }
}

/// Instance identity handed back to the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct RunningInstance {
    pub model: String,
    pub service: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
}

/// Summary of one supervised model for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub port: u16,
    pub status: InstanceState,
    pub start_time: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub usage_count: u64,
    pub description: String,
}

/// Performance view of one supervised model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelMetrics {
    pub name: String,
    pub status: InstanceState,
    pub usage_count: u64,
    pub uptime_seconds: i64,
    pub last_used: DateTime<Utc>,
    pub port: u16,
    pub threads: u32,
    pub context_length: u32,
}

#[derive(Clone)]
struct ManagedInstance {
    spec: ModelSpec,
    service: String,
    instance_id: String,
    port: u16,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    ready_rx: watch::Receiver<bool>,
}

type InstanceMap = Arc<Mutex<HashMap<String, ManagedInstance>>>;

/// Supervises backend processes, one per model.
pub struct Supervisor {
    config: SupervisorConfig,
    catalog: Arc<CatalogHandle>,
    registry: Arc<ServiceRegistry>,
    ports: Arc<PortPool>,
    backend: BackendClient,
    instances: InstanceMap,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        catalog: Arc<CatalogHandle>,
        registry: Arc<ServiceRegistry>,
    ) -> Self {
        let ports = Arc::new(PortPool::new(
            config.port_range_start..=config.port_range_end,
        ));
        Self {
            config,
            catalog,
            registry,
            ports,
            backend: BackendClient::new(),
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The port pool, shared for diagnostics.
    pub fn ports(&self) -> Arc<PortPool> {
        Arc::clone(&self.ports)
    }

    /// Ensure a backend for `model` exists, spawning one if necessary.
    ///
    /// Returns as soon as the instance is registered; readiness is
    /// asynchronous (use [`Supervisor::wait_ready`] to block on it). When
    /// another caller is already starting the model, this waits on that
    /// instance's readiness for a bounded time instead of spawning a second
    /// one.
    pub async fn ensure(&self, model: &str) -> Result<RunningInstance> {
        // Fast path under the supervisor lock: reuse a live instance.
        let starting = {
            let instances = self.instances.lock();
            if let Some(managed) = instances.get(model) {
                let state = self
                    .registry
                    .get(&managed.service, &managed.instance_id)
                    .map(|i| i.status);
                match state {
                    Some(InstanceState::Healthy) | Some(InstanceState::Unhealthy) => {
                        return Ok(self.running_info(model, managed));
                    }
                    Some(InstanceState::Starting) => {
                        Some((self.running_info(model, managed), managed.ready_rx.clone()))
                    }
                    // Stopping/Stopped/Failed or record already gone: spawn anew
                    _ => None,
                }
            } else {
                None
            }
        };

        if let Some((info, mut ready_rx)) = starting {
            return match timeout(self.config.ready_wait, ready_rx.wait_for(|ready| *ready)).await {
                Ok(Ok(_)) => Ok(info),
                Ok(Err(_)) => Err(Error::spawn(format!(
                    "model {} backend exited before becoming ready",
                    model
                ))),
                Err(_) => Err(Error::timeout(format!(
                    "model {} did not become ready in time",
                    model
                ))),
            };
        }

        self.spawn_instance(model)
    }

    /// Spawn a new backend for `model` and register it.
    fn spawn_instance(&self, model: &str) -> Result<RunningInstance> {
        let spec = self.catalog.find_active(model)?;

        let mut instances = self.instances.lock();

        // Double-check: a concurrent ensure may have won the race while we
        // were not holding the lock.
        if let Some(managed) = instances.get(model) {
            let live = self
                .registry
                .get(&managed.service, &managed.instance_id)
                .map(|i| i.status.is_live())
                .unwrap_or(false);
            if live {
                return Ok(self.running_info(model, managed));
            }
        }

        let port = self.ports.acquire().ok_or(Error::PortsExhausted)?;
        let args = build_args(&spec, port, &self.config.bind_host);
        info!(
            model = %model,
            port,
            command = %self.config.llama_cpp_path,
            "Starting backend process"
        );
        debug!(model = %model, args = ?args, "Backend command line");

        let child = match Command::new(&self.config.llama_cpp_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(port);
                return Err(Error::spawn(format!(
                    "failed to start {} for model {}: {}",
                    self.config.llama_cpp_path, model, e
                )));
            }
        };

        let service = service_name(model);
        let metadata = HashMap::from([
            ("model_name".to_string(), spec.model_name.clone()),
            ("model_file".to_string(), spec.model_file.clone()),
            (
                "context_length".to_string(),
                spec.context_length.to_string(),
            ),
            ("threads".to_string(), spec.threads.to_string()),
        ]);
        let instance_id = self.registry.register(ServiceInstance::new(
            &service,
            &self.config.bind_host,
            port,
            metadata,
        ));

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = watch::channel(false);
        let managed = ManagedInstance {
            spec,
            service: service.clone(),
            instance_id: instance_id.clone(),
            port,
            started_at: Utc::now(),
            cancel: cancel.clone(),
            ready_rx: ready_rx.clone(),
        };
        let info = self.running_info(model, &managed);
        instances.insert(model.to_string(), managed);
        drop(instances);

        // Monitor owns the child; readiness flips Starting -> Healthy.
        tokio::spawn(monitor(
            Arc::clone(&self.registry),
            Arc::clone(&self.ports),
            Arc::clone(&self.instances),
            self.config.stop_grace,
            model.to_string(),
            service.clone(),
            instance_id.clone(),
            port,
            child,
            cancel.clone(),
            ready_rx,
        ));
        tokio::spawn(await_readiness(
            self.backend.clone(),
            Arc::clone(&self.registry),
            self.config.bind_host.clone(),
            self.config.startup_timeout,
            self.config.readiness_poll,
            model.to_string(),
            service,
            instance_id,
            port,
            cancel,
            ready_tx,
        ));

        Ok(info)
    }

    /// Block until the model's backend answers health probes, up to `bound`.
    pub async fn wait_ready(&self, model: &str, bound: Duration) -> Result<()> {
        let mut ready_rx = {
            let instances = self.instances.lock();
            match instances.get(model) {
                Some(managed) => managed.ready_rx.clone(),
                // The backend may already have died and been reaped.
                None => {
                    return Err(Error::unavailable(format!("model {} is not running", model)))
                }
            }
        };

        let result = match timeout(bound, ready_rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::unavailable(format!(
                "model {} backend exited before becoming ready",
                model
            ))),
            Err(_) => Err(Error::unavailable(format!(
                "model {} backend is not ready",
                model
            ))),
        };
        result
    }

    /// Stop a model's backend. Idempotent; an unknown model is an error.
    pub fn stop(&self, model: &str) -> Result<()> {
        let managed = {
            let instances = self.instances.lock();
            instances
                .get(model)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("model {} is not running", model)))?
        };

        info!(model = %model, port = managed.port, "Stopping backend process");
        self.registry
            .set_state(&managed.service, &managed.instance_id, InstanceState::Stopping);
        managed.cancel.cancel();
        Ok(())
    }

    /// Restart a model: stop if running, then ensure.
    pub async fn restart(&self, model: &str) -> Result<RunningInstance> {
        if let Err(e) = self.stop(model) {
            debug!(model = %model, error = %e, "Restart of idle model, nothing to stop");
        }
        // Give the monitor a moment to reap and release the port.
        sleep(Duration::from_millis(50)).await;
        self.ensure(model).await
    }

    /// Status summary for every supervised model.
    pub fn list_running(&self) -> Vec<ModelStatus> {
        let instances = self.instances.lock();
        instances
            .iter()
            .filter_map(|(model, managed)| self.status_of(model, managed))
            .collect()
    }

    /// Status of one model.
    pub fn status(&self, model: &str) -> Result<ModelStatus> {
        let instances = self.instances.lock();
        instances
            .get(model)
            .and_then(|managed| self.status_of(model, managed))
            .ok_or_else(|| Error::not_found(format!("model {} is not running", model)))
    }

    /// Per-model usage metrics.
    pub fn metrics(&self) -> Vec<ModelMetrics> {
        let instances = self.instances.lock();
        instances
            .iter()
            .filter_map(|(model, managed)| {
                let record = self.registry.get(&managed.service, &managed.instance_id)?;
                Some(ModelMetrics {
                    name: model.clone(),
                    status: record.status,
                    usage_count: record.usage_count,
                    uptime_seconds: (Utc::now() - managed.started_at).num_seconds(),
                    last_used: record.last_used,
                    port: managed.port,
                    threads: managed.spec.threads,
                    context_length: managed.spec.context_length,
                })
            })
            .collect()
    }

    /// Cancel every supervised instance. Used on shutdown.
    pub fn shutdown(&self) {
        let instances = self.instances.lock();
        for (model, managed) in instances.iter() {
            info!(model = %model, "Shutting down backend process");
            managed.cancel.cancel();
        }
    }

    fn running_info(&self, model: &str, managed: &ManagedInstance) -> RunningInstance {
        RunningInstance {
            model: model.to_string(),
            service: managed.service.clone(),
            instance_id: managed.instance_id.clone(),
            host: self.config.bind_host.clone(),
            port: managed.port,
        }
    }

    fn status_of(&self, model: &str, managed: &ManagedInstance) -> Option<ModelStatus> {
        let record = self.registry.get(&managed.service, &managed.instance_id)?;
        Some(ModelStatus {
            name: model.to_string(),
            port: managed.port,
            status: record.status,
            start_time: managed.started_at,
            last_used: record.last_used,
            usage_count: record.usage_count,
            description: managed.spec.description.clone(),
        })
    }
}

/// Poll the backend until it answers `/health`, then flip it healthy.
/// Gives up (and cancels the instance) after the startup timeout.
#[allow(clippy::too_many_arguments)]
async fn await_readiness(
    backend: BackendClient,
    registry: Arc<ServiceRegistry>,
    host: String,
    startup_timeout: Duration,
    poll: Duration,
    model: String,
    service: String,
    instance_id: String,
    port: u16,
    cancel: CancellationToken,
    ready_tx: watch::Sender<bool>,
) {
    let deadline = Instant::now() + startup_timeout;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(poll) => {}
        }

        if backend.health(&host, port).await {
            registry.mark_healthy(&service, &instance_id);
            let _ = ready_tx.send(true);
            info!(model = %model, port, "Backend ready");
            return;
        }

        if Instant::now() >= deadline {
            warn!(
                model = %model,
                port,
                timeout_secs = startup_timeout.as_secs(),
                "Backend never became ready, stopping it"
            );
            cancel.cancel();
            return;
        }
    }
}

/// Wait for the child to exit (or be cancelled) and clean up exactly once:
/// deregister, then release the port, then drop the record.
#[allow(clippy::too_many_arguments)]
async fn monitor(
    registry: Arc<ServiceRegistry>,
    ports: Arc<PortPool>,
    instances: InstanceMap,
    stop_grace: Duration,
    model: String,
    service: String,
    instance_id: String,
    port: u16,
    mut child: Child,
    cancel: CancellationToken,
    ready_rx: watch::Receiver<bool>,
) {
    let cancelled = tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) if status.success() => {
                    info!(model = %model, "Backend exited cleanly");
                }
                Ok(status) => {
                    warn!(model = %model, %status, "Backend exited abnormally");
                }
                Err(e) => {
                    error!(model = %model, error = %e, "Failed to reap backend");
                }
            }
            false
        }
        _ = cancel.cancelled() => {
            terminate(&mut child, stop_grace).await;
            true
        }
    };

    // Stops the readiness poller if it is still running.
    cancel.cancel();

    let final_state = if cancelled || *ready_rx.borrow() {
        InstanceState::Stopped
    } else {
        InstanceState::Failed
    };
    if final_state == InstanceState::Failed {
        warn!(model = %model, port, "Backend failed before becoming ready");
    }

    if let Err(e) = registry.deregister(&service, &instance_id) {
        debug!(model = %model, error = %e, "Instance already deregistered");
    }
    ports.release(port);

    let mut instances = instances.lock();
    if instances
        .get(&model)
        .map(|m| m.instance_id == instance_id)
        .unwrap_or(false)
    {
        instances.remove(&model);
    }
    info!(model = %model, port, state = %final_state, "Backend reaped");
}

/// Build the backend command line from the model declaration. Sampling
/// parameters are passed only when they differ from the backend defaults.
pub fn build_args(spec: &ModelSpec, port: u16, host: &str) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        spec.weights_path(),
        "--port".to_string(),
        port.to_string(),
        "--host".to_string(),
        host.to_string(),
        "-c".to_string(),
        spec.context_length.to_string(),
        "-t".to_string(),
        spec.threads.to_string(),
    ];

    if (spec.temperature - DEFAULT_TEMPERATURE).abs() > f64::EPSILON {
        args.push("--temp".to_string());
        args.push(format!("{:.2}", spec.temperature));
    }
    if (spec.top_p - DEFAULT_TOP_P).abs() > f64::EPSILON {
        args.push("--top-p".to_string());
        args.push(format!("{:.2}", spec.top_p));
    }
    if (spec.repeat_penalty - DEFAULT_REPEAT_PENALTY).abs() > f64::EPSILON {
        args.push("--repeat-penalty".to_string());
        args.push(format!("{:.2}", spec.repeat_penalty));
    }
    if spec.gpu_layers > 0 {
        args.push("-ngl".to_string());
        args.push(spec.gpu_layers.to_string());
    }

    args
}

/// SIGTERM first, SIGKILL after the grace period.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
            if timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            warn!(pid, "Backend ignored SIGTERM, killing");
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        error!(error = %e, "Failed to kill backend process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::catalog::ModelCatalog;

    fn test_spec(name: &str) -> ModelSpec {
        ModelSpec {
            model_name: name.to_string(),
            model_file: format!("{}.gguf", name),
            model_path: "/srv/models".to_string(),
            context_length: 4096,
            max_tokens: 256,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            repeat_penalty: DEFAULT_REPEAT_PENALTY,
            threads: 8,
            gpu_layers: 0,
            active: true,
            description: String::new(),
        }
    }

    fn test_supervisor(llama_cpp_path: &str, models: Vec<ModelSpec>) -> Supervisor {
        let config = SupervisorConfig {
            llama_cpp_path: llama_cpp_path.to_string(),
            port_range_start: 18081,
            port_range_end: 18090,
            startup_timeout: Duration::from_secs(2),
            readiness_poll: Duration::from_millis(50),
            ready_wait: Duration::from_millis(500),
            stop_grace: Duration::from_millis(200),
            ..SupervisorConfig::default()
        };
        let catalog = Arc::new(CatalogHandle::new(ModelCatalog { models }));
        let registry = Arc::new(ServiceRegistry::new());
        Supervisor::new(config, catalog, registry)
    }

    #[test]
    fn test_build_args_with_defaults() {
        let spec = test_spec("m1");
        let args = build_args(&spec, 8081, "127.0.0.1");
        assert_eq!(
            args,
            vec![
                "-m",
                "/srv/models/m1.gguf",
                "--port",
                "8081",
                "--host",
                "127.0.0.1",
                "-c",
                "4096",
                "-t",
                "8",
            ]
        );
    }

    #[test]
    fn test_build_args_with_overrides() {
        let mut spec = test_spec("m1");
        spec.temperature = 0.7;
        spec.top_p = 0.95;
        spec.repeat_penalty = 1.1;
        spec.gpu_layers = 20;

        let args = build_args(&spec, 8082, "127.0.0.1");
        let joined = args.join(" ");
        assert!(joined.contains("--temp 0.70"));
        assert!(joined.contains("--top-p 0.95"));
        assert!(joined.contains("--repeat-penalty 1.10"));
        assert!(joined.contains("-ngl 20"));
    }

    #[tokio::test]
    async fn test_ensure_unknown_model() {
        let supervisor = test_supervisor("/bin/true", vec![]);
        let err = supervisor.ensure("ghost").await.unwrap_err();
        assert_eq!(err.to_http_status(), 404);
    }

    #[tokio::test]
    async fn test_ensure_inactive_model() {
        let mut spec = test_spec("m1");
        spec.active = false;
        let supervisor = test_supervisor("/bin/true", vec![spec]);
        assert!(supervisor.ensure("m1").await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_port() {
        let supervisor = test_supervisor("/nonexistent/llama-server", vec![test_spec("m1")]);
        let available = supervisor.ports.available();

        let err = supervisor.ensure("m1").await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert_eq!(supervisor.ports.available(), available);
        assert!(supervisor.registry.all_services().is_empty());
    }

    #[tokio::test]
    async fn test_port_exhaustion() {
        let supervisor = test_supervisor("/bin/true", vec![test_spec("m1")]);
        // drain the pool before asking for a model
        while supervisor.ports.acquire().is_some() {}

        let err = supervisor.ensure("m1").await.unwrap_err();
        assert!(matches!(err, Error::PortsExhausted));
    }

    #[tokio::test]
    async fn test_exited_child_is_reaped_and_cleaned_up() {
        // /bin/true ignores its arguments and exits immediately, so the
        // monitor observes an exit before readiness and must clean up.
        let supervisor = test_supervisor("/bin/true", vec![test_spec("m1")]);
        let info = supervisor.ensure("m1").await.unwrap();
        assert_eq!(info.service, "llm-model-m1");
        assert_eq!(info.port, 18081);

        // wait for the monitor to finish
        for _ in 0..100 {
            if supervisor.instances.lock().is_empty() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        assert!(supervisor.instances.lock().is_empty());
        assert!(supervisor.registry.all_services().is_empty());
        assert_eq!(supervisor.ports.available(), 10);
    }

    #[tokio::test]
    async fn test_wait_ready_fails_when_backend_dies() {
        let supervisor = test_supervisor("/bin/true", vec![test_spec("m1")]);
        supervisor.ensure("m1").await.unwrap();

        let err = supervisor
            .wait_ready("m1", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.to_http_status(), 503);
    }

    #[tokio::test]
    async fn test_stop_unknown_model() {
        let supervisor = test_supervisor("/bin/true", vec![test_spec("m1")]);
        let err = supervisor.stop("m1").unwrap_err();
        assert_eq!(err.to_http_status(), 404);
    }

    #[tokio::test]
    async fn test_list_running_after_cleanup() {
        let supervisor = test_supervisor("/bin/true", vec![test_spec("m1")]);
        supervisor.ensure("m1").await.unwrap();

        for _ in 0..100 {
            if supervisor.list_running().is_empty() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(supervisor.list_running().is_empty());
    }
}
