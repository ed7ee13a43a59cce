//! # fleet-gateway
//!
//! HTTP ingress for the fleet control plane.
//!
//! This crate wires the supervisor, registry, and cluster manager behind an
//! axum router and adds the dispatch-boundary policies:
//!
//! - Typed completion dispatch and the opaque reverse proxy
//! - Layered token-bucket rate limiting (global, per-principal, per-model)
//! - The quota gate around each completion
//! - Monitoring, log, discovery, and cluster endpoints
//! - The `fleetd` binary

pub mod auth;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod logs;
pub mod metrics;
pub mod proxy;
pub mod quota;
pub mod ratelimit;
pub mod server;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;
