//! Service registry HTTP surface

use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use fleet_core::Error;
use fleet_registry::{SelectionStrategy, ServiceInstance};
use serde::Deserialize;
use serde_json::json;

/// Register a service instance.
pub async fn register(
    State(state): State<AppState>,
    Json(instance): Json<ServiceInstance>,
) -> ApiResult<Json<serde_json::Value>> {
    if instance.name.is_empty() {
        return Err(Error::invalid_request("service name is required").into());
    }

    let instance_id = state.registry.register(instance);
    Ok(Json(json!({
        "success": true,
        "message": "service registered",
        "instance_id": instance_id,
    })))
}

/// Deregister a service instance.
pub async fn deregister(
    State(state): State<AppState>,
    Path((service, instance)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    state.registry.deregister(&service, &instance)?;
    Ok(Json(json!({
        "success": true,
        "message": "service deregistered",
    })))
}

/// All registered services.
pub async fn services(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": state.registry.all_services(),
    }))
}

/// Healthy instances of one service.
pub async fn service_instances(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let instances = state.registry.discover(&service)?;
    Ok(Json(json!({
        "success": true,
        "data": instances,
    })))
}

/// Aggregated registry statistics.
pub async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": state.registry.stats(),
    }))
}

/// Current instance selection strategy.
pub async fn get_strategy(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": { "strategy": state.dispatcher.strategy().to_string() },
    }))
}

#[derive(Debug, Deserialize)]
pub struct SetStrategyRequest {
    pub strategy: String,
}

/// Replace the instance selection strategy.
pub async fn set_strategy(
    State(state): State<AppState>,
    Json(request): Json<SetStrategyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let strategy: SelectionStrategy = request.strategy.parse().map_err(|_| {
        Error::invalid_request(format!(
            "invalid strategy {:?}, valid strategies: random, round_robin, least_connections",
            request.strategy
        ))
    })?;

    state.dispatcher.set_strategy(strategy);
    Ok(Json(json!({
        "success": true,
        "message": "load balancing strategy updated",
        "strategy": strategy.to_string(),
    })))
}
