//! Router assembly and the HTTP server

use crate::auth::{attach_principal, Principal};
use crate::error::ApiError;
use crate::handlers::{cluster, discovery, models, observability, openai};
use crate::state::AppState;
use axum::extract::{Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use fleet_core::{Error, Result};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Assemble the full router.
pub fn build_router(state: AppState) -> Router {
    let model_scoped = Router::new()
        .route("/:name/start", post(models::start_model))
        .route("/:name/stop", post(models::stop_model))
        .route("/:name/restart", post(models::restart_model))
        .route("/:name/status", get(models::model_status))
        .route("/:name/chat", post(models::chat_with_model))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            model_rate_limit,
        ));

    let models_routes = Router::new()
        .route("/", get(models::list_models))
        .route("/running", get(models::running_models))
        .route("/metrics", get(models::model_metrics))
        .merge(model_scoped);

    let openai_routes = Router::new()
        .route("/chat/completions", post(openai::chat_completions))
        .route("/models", get(openai::list_models))
        .route("/batch", post(openai::batch))
        .route("/proxy/:model/*path", any(openai::proxy));

    let discovery_routes = Router::new()
        .route("/register", post(discovery::register))
        .route("/:service/:instance", delete(discovery::deregister))
        .route("/services", get(discovery::services))
        .route("/services/:service", get(discovery::service_instances))
        .route("/stats", get(discovery::stats))
        .route(
            "/load-balancer/strategy",
            get(discovery::get_strategy).put(discovery::set_strategy),
        );

    let monitoring_routes = Router::new()
        .route(
            "/metrics",
            get(observability::list_metrics).post(observability::record_metric),
        )
        .route("/metrics/:name", get(observability::metrics_by_name))
        .route("/system", get(observability::system_stats));

    let log_routes = Router::new()
        .route("/", get(observability::get_logs).post(observability::write_log))
        .route("/loggers", get(observability::loggers));

    let cluster_routes = Router::new()
        .route("/join", post(cluster::join))
        .route("/leave", post(cluster::leave))
        .route("/heartbeat", post(cluster::heartbeat))
        .route("/nodes", get(cluster::nodes))
        .route("/stats", get(cluster::stats))
        .route("/select", get(cluster::select));

    let api = Router::new()
        .nest("/models", models_routes)
        .nest("/v1", openai_routes)
        .nest("/discovery", discovery_routes)
        .nest("/monitoring", monitoring_routes)
        .nest("/logs", log_routes)
        .nest("/cluster", cluster_routes)
        .route("/rate-limit/status", get(rate_limit_status))
        .layer(middleware::from_fn_with_state(state.clone(), user_rate_limit));

    Router::new()
        .route("/health", get(health))
        .route("/status", get(system_status))
        .nest("/api/v1", api)
        .layer(middleware::from_fn_with_state(state.clone(), track_metrics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            global_rate_limit,
        ))
        .layer(middleware::from_fn(attach_principal))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until interrupted.
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::network(format!("failed to bind {}: {}", addr, e)))?;

    info!(%addr, "Gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await
    .map_err(|e| Error::internal(format!("server error: {}", e)))?;

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, stopping backends");
    state.supervisor.shutdown();
}

// Middleware

async fn global_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Err(e) = state.limiters.check_global() {
        return ApiError(e).into_response();
    }
    next.run(request).await
}

async fn user_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let rate_key = request
        .extensions()
        .get::<Principal>()
        .map(|p| p.rate_key())
        .unwrap_or_else(|| "ip:unknown".to_string());

    if let Err(e) = state.limiters.check_user(&rate_key) {
        return ApiError(e).into_response();
    }
    next.run(request).await
}

async fn model_rate_limit(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(e) = state.limiters.check_model(&name) {
        return ApiError(e).into_response();
    }
    next.run(request).await
}

async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let labels = HashMap::from([
        ("method".to_string(), method),
        ("path".to_string(), path),
        ("status".to_string(), response.status().as_u16().to_string()),
    ]);
    state
        .metrics
        .increment_counter("http_requests_total", labels.clone(), "HTTP requests served");
    state.metrics.observe(
        "http_request_duration_ms",
        start.elapsed().as_secs_f64() * 1000.0,
        labels,
        "HTTP request latency",
    );

    response
}

// Root handlers

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let running = state.supervisor.list_running().len();
    let status = if running == 0 {
        "no_models_running"
    } else {
        "healthy"
    };

    Json(json!({
        "status": status,
        "timestamp": Utc::now().timestamp(),
        "running_models": running,
        "version": env!("CARGO_PKG_VERSION"),
        "registry": state.registry.stats(),
    }))
}

async fn system_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let running = state.supervisor.list_running();
    let available = state.catalog.list_active();

    Json(json!({
        "success": true,
        "data": {
            "system": {
                "status": "running",
                "timestamp": Utc::now().timestamp(),
                "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
            },
            "models": {
                "available": available.len(),
                "running": running.len(),
                "details": running,
            },
        },
    }))
}

async fn rate_limit_status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": {
            "user": state.limiters.user.status(&principal.rate_key()),
            "global": state.limiters.global.status("global"),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::catalog::{CatalogHandle, ModelCatalog};
    use fleet_core::Config;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::with_catalog(
            Config::default(),
            Arc::new(CatalogHandle::new(ModelCatalog::default())),
        )
    }

    async fn get_json(
        router: Router,
        uri: &str,
    ) -> (axum::http::StatusCode, serde_json::Value) {
        use http_body_util::BodyExt;

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let router = build_router(test_state());
        let (status, body) = get_json(router, "/health").await;

        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["status"], "no_models_running");
        assert_eq!(body["running_models"], 0);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let router = build_router(test_state());
        let (status, body) = get_json(router, "/status").await;

        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["models"]["available"], 0);
    }

    #[tokio::test]
    async fn test_models_list_empty_catalog() {
        let router = build_router(test_state());
        let (status, body) = get_json(router, "/api/v1/models/").await;

        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_status_endpoint() {
        let router = build_router(test_state());
        let (status, body) = get_json(router, "/api/v1/rate-limit/status").await;

        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["data"]["global"]["capacity"], 200);
        assert_eq!(body["data"]["user"]["capacity"], 20);
    }

    #[tokio::test]
    async fn test_user_rate_limit_denies_after_burst() {
        let state = test_state();
        let router = build_router(state);

        let mut last_status = axum::http::StatusCode::OK;
        let mut last_body = serde_json::Value::Null;
        // per-principal capacity is 20; the 21st request in a burst is denied
        for _ in 0..21 {
            let (status, body) = get_json(router.clone(), "/api/v1/models/").await;
            last_status = status;
            last_body = body;
        }

        assert_eq!(last_status, axum::http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(last_body["code"], "USER_RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_cluster_select_with_only_local_node() {
        let router = build_router(test_state());
        let (status, body) = get_json(router, "/api/v1/cluster/select").await;

        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["data"]["id"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_model_status_is_404() {
        let router = build_router(test_state());
        let (status, _) = get_json(router, "/api/v1/models/ghost/status").await;
        assert_eq!(status, axum::http::StatusCode::NOT_FOUND);
    }
}
