//! Cluster membership and peer coordination

use crate::node::{ClusterNode, NodeSelectStrategy, NodeStatus};
use bytes::Bytes;
use chrono::Utc;
use fleet_core::{Error, NodeRole, Result};
use http_body_util::Full;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default interval between heartbeat rounds.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval between staleness sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on a peer RPC.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// Peers unseen for this long are marked failed.
const STALE_AFTER_MINUTES: i64 = 2;

/// Aggregated cluster statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub failed_nodes: usize,
    pub total_capacity: u64,
    pub total_tasks: u64,
    pub average_load: f64,
    pub cluster_health: f64,
}

/// Tracks the local node and every known peer.
///
/// There is no consensus here: membership converges through heartbeats, and
/// a partitioned peer is simply marked failed until it is heard from again.
pub struct ClusterManager {
    node_id: String,
    nodes: RwLock<HashMap<String, ClusterNode>>,
    round_robin: Mutex<usize>,
    client: Client<HttpConnector, Full<Bytes>>,
    heartbeat_interval: Duration,
    sweep_interval: Duration,
    peer_timeout: Duration,
}

impl ClusterManager {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let node_id = node_id.into();
        let this_node = ClusterNode::new(node_id.clone(), host, port, NodeRole::Worker);

        let mut nodes = HashMap::new();
        nodes.insert(node_id.clone(), this_node);

        Self {
            node_id,
            nodes: RwLock::new(nodes),
            round_robin: Mutex::new(0),
            client: Client::builder(TokioExecutor::new()).build_http(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Snapshot of the local node.
    pub fn self_node(&self) -> ClusterNode {
        self.nodes
            .read()
            .get(&self.node_id)
            .cloned()
            .expect("local node is always present")
    }

    /// Join a cluster by announcing ourselves to a master node.
    pub async fn join(&self, master_host: &str, master_port: u16) -> Result<()> {
        self.set_self_status(NodeStatus::Joining);

        let uri = format!(
            "http://{}:{}/api/v1/cluster/join",
            master_host, master_port
        );
        let result = self.post_node(&uri, &self.self_node()).await;

        match result {
            Ok(()) => {
                self.set_self_status(NodeStatus::Active);
                info!(master = %format!("{}:{}", master_host, master_port), "Joined cluster");
                Ok(())
            }
            Err(e) => {
                self.set_self_status(NodeStatus::Failed);
                Err(Error::network(format!(
                    "failed to join cluster at {}:{}: {}",
                    master_host, master_port, e
                )))
            }
        }
    }

    /// Leave the cluster, notifying every active peer.
    pub async fn leave(&self) -> Result<()> {
        self.set_self_status(NodeStatus::Leaving);

        let peers = self.active_peers();
        for peer in peers {
            let uri = format!("http://{}/api/v1/cluster/leave", peer.address());
            let body = serde_json::json!({ "node_id": self.node_id });
            if let Err(e) = self.post_json(&uri, &body).await {
                warn!(peer = %peer.id, error = %e, "Failed to notify peer of departure");
            }
        }

        self.set_self_status(NodeStatus::Inactive);
        info!(node = %self.node_id, "Left cluster");
        Ok(())
    }

    /// Add a node to the membership table.
    pub fn add_node(&self, mut node: ClusterNode) -> Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node.id) {
            return Err(Error::already_exists(format!("node {}", node.id)));
        }

        node.join_time = Utc::now();
        node.last_seen = Utc::now();
        node.status = NodeStatus::Active;

        info!(node = %node.id, address = %node.address(), "Node added to cluster");
        nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node from the membership table.
    pub fn remove_node(&self, node_id: &str) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .remove(node_id)
            .ok_or_else(|| Error::not_found(format!("node {}", node_id)))?;
        info!(node = %node.id, address = %node.address(), "Node removed from cluster");
        Ok(())
    }

    /// Update a node's load figures. Fails for unknown nodes.
    pub fn update_load(&self, node_id: &str, load: f64, active_tasks: u32) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::not_found(format!("node {}", node_id)))?;
        node.load = load;
        node.active_tasks = active_tasks;
        node.last_seen = Utc::now();
        Ok(())
    }

    /// Apply an incoming heartbeat: update the sender if known, add it
    /// otherwise.
    pub fn apply_heartbeat(&self, node: ClusterNode) {
        if self
            .update_load(&node.id, node.load, node.active_tasks)
            .is_err()
        {
            debug!(node = %node.id, "Heartbeat from unknown node, adding it");
            let _ = self.add_node(node);
        }
    }

    /// All known nodes.
    pub fn nodes(&self) -> HashMap<String, ClusterNode> {
        self.nodes.read().clone()
    }

    /// All active nodes, including the local one.
    pub fn active_nodes(&self) -> Vec<ClusterNode> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.status.is_active())
            .cloned()
            .collect()
    }

    /// Active nodes other than the local one.
    fn active_peers(&self) -> Vec<ClusterNode> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.id != self.node_id && n.status.is_active())
            .cloned()
            .collect()
    }

    /// Choose an active node for new work.
    pub fn select_node(&self, strategy: NodeSelectStrategy) -> Result<ClusterNode> {
        let mut active = self.active_nodes();
        if active.is_empty() {
            return Err(Error::unavailable("no active nodes in cluster"));
        }
        // stable order so round-robin cycles deterministically
        active.sort_by(|a, b| a.id.cmp(&b.id));

        let selected = match strategy {
            NodeSelectStrategy::LeastLoad => active
                .iter()
                .min_by(|a, b| a.load.partial_cmp(&b.load).unwrap_or(std::cmp::Ordering::Equal))
                .cloned()
                .expect("active list is non-empty"),
            NodeSelectStrategy::LeastTasks => active
                .iter()
                .min_by_key(|n| n.active_tasks)
                .cloned()
                .expect("active list is non-empty"),
            NodeSelectStrategy::RoundRobin => {
                let mut counter = self.round_robin.lock();
                let selected = active[*counter % active.len()].clone();
                *counter = counter.wrapping_add(1);
                selected
            }
        };

        debug!(node = %selected.id, strategy = %strategy, "Selected cluster node");
        Ok(selected)
    }

    /// Aggregated cluster statistics.
    pub fn stats(&self) -> ClusterStats {
        let nodes = self.nodes.read();
        let total_nodes = nodes.len();
        let mut active_nodes = 0;
        let mut total_load = 0.0;
        let mut total_tasks = 0u64;
        let mut total_capacity = 0u64;

        for node in nodes.values() {
            if node.status.is_active() {
                active_nodes += 1;
                total_load += node.load;
                total_tasks += node.active_tasks as u64;
                total_capacity += node.capacity as u64;
            }
        }

        let average_load = if active_nodes > 0 {
            total_load / active_nodes as f64
        } else {
            0.0
        };
        let cluster_health = if total_nodes > 0 {
            active_nodes as f64 / total_nodes as f64
        } else {
            0.0
        };

        ClusterStats {
            total_nodes,
            active_nodes,
            failed_nodes: total_nodes - active_nodes,
            total_capacity,
            total_tasks,
            average_load,
            cluster_health,
        }
    }

    /// Start the heartbeat and staleness-sweep background tasks.
    pub fn spawn_background(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let heartbeat = {
            let manager = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.heartbeat_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    manager.send_heartbeats().await;
                }
            })
        };

        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_stale();
            }
        });

        (heartbeat, sweep)
    }

    /// POST the local node snapshot to every active peer. Peers that fail
    /// the round trip are marked failed.
    pub async fn send_heartbeats(&self) {
        {
            let mut nodes = self.nodes.write();
            if let Some(this_node) = nodes.get_mut(&self.node_id) {
                this_node.last_seen = Utc::now();
            }
        }

        let this_node = self.self_node();
        let payload = match serde_json::to_vec(&this_node) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize heartbeat");
                return;
            }
        };

        let mut rounds = tokio::task::JoinSet::new();
        for peer in self.active_peers() {
            let client = self.client.clone();
            let peer_timeout = self.peer_timeout;
            let payload = payload.clone();
            rounds.spawn(async move {
                let uri = format!("http://{}/api/v1/cluster/heartbeat", peer.address());
                let ok = post_bytes(&client, &uri, payload, peer_timeout).await.is_ok();
                (peer.id, ok)
            });
        }

        while let Some(Ok((peer_id, ok))) = rounds.join_next().await {
            if !ok {
                warn!(peer = %peer_id, "Heartbeat failed, marking peer failed");
                self.mark_failed(&peer_id);
            }
        }
    }

    /// Mark peers unseen for too long as failed.
    pub fn sweep_stale(&self) {
        let stale_after = chrono::Duration::minutes(STALE_AFTER_MINUTES);
        let mut nodes = self.nodes.write();
        for (id, node) in nodes.iter_mut() {
            if *id == self.node_id {
                continue;
            }
            if node.status.is_active() && node.is_stale(stale_after) {
                warn!(node = %id, "Peer unseen for too long, marking failed");
                node.status = NodeStatus::Failed;
            }
        }
    }

    fn mark_failed(&self, node_id: &str) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(node_id) {
            node.status = NodeStatus::Failed;
        }
    }

    fn set_self_status(&self, status: NodeStatus) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(&self.node_id) {
            node.status = status;
        }
    }

    async fn post_node(&self, uri: &str, node: &ClusterNode) -> Result<()> {
        self.post_json(uri, node).await
    }

    async fn post_json<T: Serialize>(&self, uri: &str, body: &T) -> Result<()> {
        let payload = serde_json::to_vec(body)?;
        post_bytes(&self.client, uri, payload, self.peer_timeout).await
    }
}

/// POST a JSON payload to a peer with a bounded timeout.
async fn post_bytes(
    client: &Client<HttpConnector, Full<Bytes>>,
    uri: &str,
    payload: Vec<u8>,
    peer_timeout: Duration,
) -> Result<()> {
    let uri: Uri = uri
        .parse()
        .map_err(|e| Error::internal(format!("invalid peer uri: {}", e)))?;

    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload)))
        .map_err(|e| Error::internal(format!("failed to build peer request: {}", e)))?;

    let response = timeout(peer_timeout, client.request(request))
        .await
        .map_err(|_| Error::timeout("peer rpc"))?
        .map_err(|e| Error::network(format!("peer rpc failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(Error::network(format!(
            "peer rpc returned {}",
            response.status()
        )));
    }
    Ok(())
}
