//! # fleet-supervisor
//!
//! Per-model backend process lifecycle.
//!
//! The supervisor lazily spawns one llama.cpp server per model on demand,
//! allocates its TCP port from a bounded pool, registers it with the
//! service registry, actively probes readiness, and reaps the process on
//! exit or stop. It is the only component that ever holds a child process
//! handle; everything else sees instances through the registry.

pub mod backend;
pub mod ports;
pub mod supervisor;

pub use backend::{BackendClient, CompletionRequest, CompletionResponse};
pub use ports::PortPool;
pub use supervisor::{ModelMetrics, ModelStatus, RunningInstance, Supervisor, SupervisorConfig};
