//! Model lifecycle and model-scoped chat handlers

use crate::auth::Principal;
use crate::dispatch::DEFAULT_MAX_TOKENS;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

/// Catalog listing.
pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": state.catalog.list_active(),
    }))
}

/// Currently supervised models.
pub async fn running_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": state.supervisor.list_running(),
    }))
}

/// Per-model usage metrics.
pub async fn model_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "data": state.supervisor.metrics(),
    }))
}

/// Start a model's backend.
pub async fn start_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.supervisor.ensure(&name).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("model {} starting", name),
    })))
}

/// Stop a model's backend.
pub async fn stop_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.supervisor.stop(&name)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("model {} stopping", name),
    })))
}

/// Restart a model's backend.
pub async fn restart_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.supervisor.restart(&name).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("model {} restarting", name),
    })))
}

/// Detail for one supervised model.
pub async fn model_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = state.supervisor.status(&name)?;
    Ok(Json(json!({
        "success": true,
        "data": status,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ModelChatRequest {
    pub message: String,
    pub max_tokens: Option<u32>,
}

/// Quota-gated chat with one model.
pub async fn chat_with_model(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(name): Path<String>,
    Json(request): Json<ModelChatRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = principal.require_user()?.to_string();
    let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

    state.quota.precheck(&user, &request.message, max_tokens).await?;

    let outcome = state
        .dispatcher
        .chat(&name, request.message.clone(), max_tokens, None, None)
        .await?;

    let request_payload = json!({
        "message": request.message,
        "max_tokens": max_tokens,
    })
    .to_string();
    let response_payload = json!({
        "response": outcome.content,
        "tokens_consumed": outcome.tokens_used,
    })
    .to_string();
    let remaining = state
        .quota
        .settle(
            &user,
            &format!("/api/v1/models/{}/chat", name),
            outcome.tokens_used,
            &request_payload,
            &response_payload,
        )
        .await;

    let mut data = json!({
        "response": outcome.content,
        "tokens_used": outcome.tokens_used,
        "model": name,
        "port": outcome.port,
    });
    if let Some(remaining) = remaining {
        data["remaining_tokens"] = json!(remaining);
    }

    Ok(Json(json!({ "success": true, "data": data })))
}
