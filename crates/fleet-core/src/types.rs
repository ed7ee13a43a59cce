//! Core type definitions shared across fleet components

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single backend instance.
///
/// An instance is created in `Starting` and flips to `Healthy` once its
/// readiness probe answers. The health prober may demote it to `Unhealthy`
/// and promote it back. `Stopping`, `Stopped`, and `Failed` are terminal or
/// terminal-bound: the instance is no longer a routing candidate and will
/// not be probed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    /// States in which the instance holds a port and counts against the
    /// one-instance-per-model invariant.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            InstanceState::Starting | InstanceState::Healthy | InstanceState::Unhealthy
        )
    }

    /// Whether discovery may hand this instance out.
    pub fn is_routable(&self) -> bool {
        matches!(self, InstanceState::Healthy)
    }

    /// Whether the periodic health prober should still probe this instance.
    pub fn is_probeable(&self) -> bool {
        matches!(
            self,
            InstanceState::Starting | InstanceState::Healthy | InstanceState::Unhealthy
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Starting => "starting",
            InstanceState::Healthy => "healthy",
            InstanceState::Unhealthy => "unhealthy",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Roles a node can fulfill in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Master nodes accept join requests and coordinate membership
    Master,
    /// Worker nodes supervise local model instances
    Worker,
    /// Gateway nodes provide ingress without local models
    Gateway,
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(NodeRole::Master),
            "worker" => Ok(NodeRole::Worker),
            "gateway" => Ok(NodeRole::Gateway),
            _ => Err(format!("Unknown node role: {}", s)),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Worker => write!(f, "worker"),
            NodeRole::Gateway => write!(f, "gateway"),
        }
    }
}

/// Canonical discovery name for a model's backend service.
pub fn service_name(model_name: &str) -> String {
    format!("llm-model-{}", model_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_state_liveness() {
        assert!(InstanceState::Starting.is_live());
        assert!(InstanceState::Healthy.is_live());
        assert!(InstanceState::Unhealthy.is_live());
        assert!(!InstanceState::Stopping.is_live());
        assert!(!InstanceState::Stopped.is_live());
        assert!(!InstanceState::Failed.is_live());
    }

    #[test]
    fn test_instance_state_routable() {
        assert!(InstanceState::Healthy.is_routable());
        assert!(!InstanceState::Starting.is_routable());
        assert!(!InstanceState::Unhealthy.is_routable());
    }

    #[test]
    fn test_instance_state_probeable() {
        assert!(InstanceState::Unhealthy.is_probeable());
        assert!(!InstanceState::Stopping.is_probeable());
        assert!(!InstanceState::Failed.is_probeable());
    }

    #[test]
    fn test_node_role_parsing() {
        assert_eq!("master".parse::<NodeRole>().unwrap(), NodeRole::Master);
        assert_eq!("Worker".parse::<NodeRole>().unwrap(), NodeRole::Worker);
        assert_eq!("gateway".parse::<NodeRole>().unwrap(), NodeRole::Gateway);
        assert!("invalid".parse::<NodeRole>().is_err());
    }

    #[test]
    fn test_service_name() {
        assert_eq!(service_name("qwen2-7b"), "llm-model-qwen2-7b");
    }

    #[test]
    fn test_state_serde_lowercase() {
        let json = serde_json::to_string(&InstanceState::Unhealthy).unwrap();
        assert_eq!(json, "\"unhealthy\"");
        let back: InstanceState = serde_json::from_str("\"starting\"").unwrap();
        assert_eq!(back, InstanceState::Starting);
    }
}
