//! Cluster node records

use chrono::{DateTime, Duration, Utc};
use fleet_core::NodeRole;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Membership state of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Inactive,
    Joining,
    Leaving,
    Failed,
}

impl NodeStatus {
    /// Whether the node participates in selection and receives heartbeats.
    pub fn is_active(&self) -> bool {
        matches!(self, NodeStatus::Active)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Active => "active",
            NodeStatus::Inactive => "inactive",
            NodeStatus::Joining => "joining",
            NodeStatus::Leaving => "leaving",
            NodeStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One peer in the cluster, as carried by join and heartbeat messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub role: NodeRole,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    pub last_seen: DateTime<Utc>,
    pub join_time: DateTime<Utc>,

    /// Load indicator in [0, 1]
    #[serde(default)]
    pub load: f64,

    #[serde(default)]
    pub capacity: u32,

    #[serde(default)]
    pub active_tasks: u32,
}

impl ClusterNode {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16, role: NodeRole) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            name: format!("node-{}", id),
            id,
            host: host.into(),
            port,
            status: NodeStatus::Active,
            role,
            metadata: HashMap::new(),
            last_seen: now,
            join_time: now,
            load: 0.0,
            capacity: 100,
            active_tasks: 0,
        }
    }

    /// `host:port` address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this node has not been seen within `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        Utc::now() - self.last_seen > max_age
    }
}

/// How `select_node` chooses among active peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSelectStrategy {
    #[default]
    LeastLoad,
    LeastTasks,
    RoundRobin,
}

impl std::str::FromStr for NodeSelectStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "least_load" => Ok(NodeSelectStrategy::LeastLoad),
            "least_tasks" => Ok(NodeSelectStrategy::LeastTasks),
            "round_robin" => Ok(NodeSelectStrategy::RoundRobin),
            _ => Err(format!("Unknown node selection strategy: {}", s)),
        }
    }
}

impl fmt::Display for NodeSelectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeSelectStrategy::LeastLoad => write!(f, "least_load"),
            NodeSelectStrategy::LeastTasks => write!(f, "least_tasks"),
            NodeSelectStrategy::RoundRobin => write!(f, "round_robin"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_defaults() {
        let node = ClusterNode::new("n1", "127.0.0.1", 8080, NodeRole::Worker);
        assert_eq!(node.name, "node-n1");
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.load, 0.0);
        assert_eq!(node.capacity, 100);
        assert_eq!(node.address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_staleness() {
        let mut node = ClusterNode::new("n1", "127.0.0.1", 8080, NodeRole::Worker);
        assert!(!node.is_stale(Duration::minutes(2)));

        node.last_seen = Utc::now() - Duration::minutes(5);
        assert!(node.is_stale(Duration::minutes(2)));
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&NodeStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
        assert!(NodeStatus::Active.is_active());
        assert!(!NodeStatus::Joining.is_active());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "least_load".parse::<NodeSelectStrategy>().unwrap(),
            NodeSelectStrategy::LeastLoad
        );
        assert_eq!(
            "least_tasks".parse::<NodeSelectStrategy>().unwrap(),
            NodeSelectStrategy::LeastTasks
        );
        assert_eq!(
            "round_robin".parse::<NodeSelectStrategy>().unwrap(),
            NodeSelectStrategy::RoundRobin
        );
        assert!("fastest".parse::<NodeSelectStrategy>().is_err());
    }

    #[test]
    fn test_node_round_trips_through_json() {
        let node = ClusterNode::new("n1", "10.0.0.5", 8080, NodeRole::Master);
        let json = serde_json::to_string(&node).unwrap();
        let back: ClusterNode = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "n1");
        assert_eq!(back.role, NodeRole::Master);
        assert_eq!(back.status, NodeStatus::Active);
    }
}
