//! # fleet-cluster
//!
//! Peer membership for multi-node deployments.
//!
//! Nodes exchange explicit heartbeat messages over HTTP; there is no
//! consensus and no shared state beyond what heartbeats carry. Stale views
//! of peer load are bounded by the heartbeat interval, which is acceptable
//! because each node independently supervises its own model instances.

pub mod manager;
pub mod node;

pub use manager::{ClusterManager, ClusterStats};
pub use node::{ClusterNode, NodeSelectStrategy, NodeStatus};
