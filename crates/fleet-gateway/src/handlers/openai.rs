//! OpenAI-compatible surface and the opaque proxy

use crate::auth::Principal;
use crate::dispatch::{build_prompt, ChatMessage, DEFAULT_MAX_TOKENS};
use crate::error::ApiResult;
use crate::quota::estimate_tokens;
use crate::state::AppState;
use axum::extract::{Path, Request, State};
use axum::response::Response;
use axum::{Extension, Json};
use chrono::Utc;
use fleet_core::{service_name, Error};
use serde::Deserialize;
use serde_json::json;

/// Upper bound on batch size.
const MAX_BATCH: usize = 10;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stream: bool,
}

/// OpenAI-compatible chat completion.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<ChatCompletionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = principal.require_user()?.to_string();
    let envelope = complete_one(&state, &user, request).await?;
    Ok(Json(envelope))
}

/// OpenAI-compatible model listing.
pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let created = Utc::now().timestamp();
    let data: Vec<serde_json::Value> = state
        .catalog
        .list_active()
        .into_iter()
        .map(|model| {
            json!({
                "id": model.model_name,
                "object": "model",
                "created": created,
                "owned_by": "local",
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}

/// Bounded batch of completions; failures are isolated per item.
pub async fn batch(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(requests): Json<Vec<ChatCompletionRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = principal.require_user()?.to_string();
    if requests.len() > MAX_BATCH {
        return Err(Error::invalid_request(format!(
            "batch size too large, maximum {} requests allowed",
            MAX_BATCH
        ))
        .into());
    }

    let mut responses = Vec::with_capacity(requests.len());
    for (index, request) in requests.into_iter().enumerate() {
        match complete_one(&state, &user, request).await {
            Ok(envelope) => responses.push(json!({
                "index": index,
                "response": envelope,
            })),
            Err(e) => responses.push(json!({
                "index": index,
                "error": e.0.to_string(),
            })),
        }
    }

    Ok(Json(json!({
        "object": "batch.completion",
        "created": Utc::now().timestamp(),
        "responses": responses,
    })))
}

/// Opaque reverse proxy to a model's backend.
pub async fn proxy(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((model, path)): Path<(String, String)>,
    request: Request,
) -> ApiResult<Response> {
    state.limiters.check_model(&model)?;
    state.supervisor.ensure(&model).await?;
    state
        .supervisor
        .wait_ready(&model, crate::dispatch::COLD_START_WAIT)
        .await?;

    let service = service_name(&model);
    let instance = state.registry.pick(&service, state.dispatcher.strategy())?;
    let response = state
        .proxy
        .forward(&instance, request, &path, &principal.client_ip)
        .await?;
    Ok(response)
}

/// Run one completion through the quota gate and wrap it in the OpenAI
/// envelope.
async fn complete_one(
    state: &AppState,
    user: &str,
    request: ChatCompletionRequest,
) -> ApiResult<serde_json::Value> {
    let model = match request.model {
        Some(model) if !model.is_empty() => model,
        // default to the first active catalog entry
        _ => state
            .catalog
            .list_active()
            .first()
            .map(|m| m.model_name.clone())
            .ok_or_else(|| Error::invalid_request("no model specified and catalog is empty"))?,
    };

    state.limiters.check_model(&model)?;

    let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let prompt = build_prompt(&request.messages);

    state.quota.precheck(user, &prompt, max_tokens).await?;

    let outcome = state
        .dispatcher
        .chat(
            &model,
            prompt.clone(),
            max_tokens,
            request.temperature,
            request.top_p,
        )
        .await?;

    let request_payload = json!({
        "model": model,
        "max_tokens": max_tokens,
        "prompt": prompt,
    })
    .to_string();
    let response_payload = json!({
        "response": outcome.content,
        "tokens_consumed": outcome.tokens_used,
    })
    .to_string();
    state
        .quota
        .settle(
            user,
            "/api/v1/v1/chat/completions",
            outcome.tokens_used,
            &request_payload,
            &response_payload,
        )
        .await;

    let prompt_tokens = estimate_tokens(&prompt);
    let completion_tokens = (outcome.tokens_used - prompt_tokens).max(0);
    Ok(json!({
        "id": format!("chatcmpl-{}", Utc::now().timestamp()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": outcome.content,
            },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": outcome.tokens_used,
        },
    }))
}
