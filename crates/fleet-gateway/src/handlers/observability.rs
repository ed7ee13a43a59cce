//! Monitoring and log endpoints

use crate::error::ApiResult;
use crate::metrics::MetricKind;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use fleet_core::Error;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

/// All collected metrics.
pub async fn list_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": state.metrics.snapshot(),
    }))
}

/// Metrics sharing one name.
pub async fn metrics_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let metrics = state.metrics.by_name(&name);
    if metrics.is_empty() {
        return Err(Error::not_found(format!("metric {}", name)).into());
    }
    Ok(Json(json!({
        "success": true,
        "data": metrics,
    })))
}

/// Process-level statistics.
pub async fn system_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": state.metrics.system_stats(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecordMetricRequest {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub value: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub help: String,
}

fn default_kind() -> String {
    "gauge".to_string()
}

/// Record a custom metric.
pub async fn record_metric(
    State(state): State<AppState>,
    Json(request): Json<RecordMetricRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let kind = match request.kind.as_str() {
        "counter" => MetricKind::Counter,
        "gauge" => MetricKind::Gauge,
        "histogram" => MetricKind::Histogram,
        other => {
            return Err(Error::invalid_request(format!("unknown metric kind {:?}", other)).into())
        }
    };

    state
        .metrics
        .record(&request.name, kind, request.value, request.labels, &request.help);
    Ok(Json(json!({
        "success": true,
        "message": "metric recorded",
    })))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub level: Option<String>,
    pub logger: Option<String>,
    pub limit: Option<usize>,
}

/// Recent log entries.
pub async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let entries = state
        .logs
        .query(query.level.as_deref(), query.logger.as_deref(), limit);
    Json(json!({
        "success": true,
        "count": entries.len(),
        "data": entries,
    }))
}

/// Distinct logger names.
pub async fn loggers(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": state.logs.loggers(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct WriteLogRequest {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_logger")]
    pub logger: String,
    pub message: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_logger() -> String {
    "api".to_string()
}

/// Append a log entry through the API.
pub async fn write_log(
    State(state): State<AppState>,
    Json(request): Json<WriteLogRequest>,
) -> Json<serde_json::Value> {
    state
        .logs
        .write(&request.level, &request.logger, &request.message);
    Json(json!({
        "success": true,
        "message": "log recorded",
    }))
}
