//! Cluster membership HTTP surface

use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use fleet_cluster::{ClusterNode, NodeSelectStrategy};
use fleet_core::Error;
use serde::Deserialize;
use serde_json::json;

/// A peer announces itself.
pub async fn join(
    State(state): State<AppState>,
    Json(node): Json<ClusterNode>,
) -> ApiResult<Json<serde_json::Value>> {
    let node_id = node.id.clone();
    state.cluster.add_node(node)?;
    Ok(Json(json!({
        "success": true,
        "message": "node joined",
        "node_id": node_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LeaveRequest {
    pub node_id: String,
}

/// A peer announces its departure.
pub async fn leave(
    State(state): State<AppState>,
    Json(request): Json<LeaveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.cluster.remove_node(&request.node_id)?;
    Ok(Json(json!({
        "success": true,
        "message": "node left",
    })))
}

/// Heartbeat from a peer; unknown peers are added.
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(node): Json<ClusterNode>,
) -> Json<serde_json::Value> {
    state.cluster.apply_heartbeat(node);
    Json(json!({
        "success": true,
        "message": "heartbeat received",
    }))
}

/// Every known node.
pub async fn nodes(State(state): State<AppState>) -> Json<serde_json::Value> {
    let nodes = state.cluster.nodes();
    Json(json!({
        "success": true,
        "count": nodes.len(),
        "data": nodes,
    }))
}

/// Aggregated cluster statistics.
pub async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": state.cluster.stats(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SelectQuery {
    pub strategy: Option<String>,
}

/// Pick an active node for new work.
pub async fn select(
    State(state): State<AppState>,
    Query(query): Query<SelectQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let strategy = match query.strategy.as_deref() {
        Some(s) => s
            .parse::<NodeSelectStrategy>()
            .map_err(Error::invalid_request)?,
        None => NodeSelectStrategy::default(),
    };

    let node = state.cluster.select_node(strategy)?;
    Ok(Json(json!({
        "success": true,
        "data": node,
    })))
}
