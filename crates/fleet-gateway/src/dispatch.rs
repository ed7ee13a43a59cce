//! Typed completion dispatch
//!
//! The dispatcher turns a chat request into a backend `/completion` call:
//! ensure the model's backend exists, wait out its cold start, pick a
//! healthy instance, forward, and account for the result. A transport
//! failure demotes the instance immediately and retries once against a
//! fresh pick if any healthy instance remains.

use crate::quota::estimate_tokens;
use fleet_core::{service_name, Result};
use fleet_registry::{SelectionStrategy, ServiceRegistry};
use fleet_supervisor::{BackendClient, CompletionRequest, Supervisor};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Bound on waiting for a freshly spawned backend to start answering.
pub const COLD_START_WAIT: Duration = Duration::from_secs(5);

/// Default completion budget when the request does not set one.
pub const DEFAULT_MAX_TOKENS: u32 = 200;

/// Sequences that end a completion.
const STOP_SEQUENCES: [&str; 3] = ["\n\n", "User:", "###"];

/// One chat message in the OpenAI shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Compose the backend prompt from a message list, with role prefixes and
/// a trailing assistant cue.
pub fn build_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        match message.role.as_str() {
            "system" => {
                prompt.push_str("System: ");
                prompt.push_str(&message.content);
                prompt.push('\n');
            }
            "user" => {
                prompt.push_str("User: ");
                prompt.push_str(&message.content);
                prompt.push('\n');
            }
            "assistant" => {
                prompt.push_str("Assistant: ");
                prompt.push_str(&message.content);
                prompt.push('\n');
            }
            _ => {}
        }
    }
    prompt.push_str("Assistant: ");
    prompt
}

/// Result of a dispatched completion.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub tokens_used: i64,
    pub model: String,
    pub port: u16,
}

/// Routes completion calls onto healthy backend instances.
pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    registry: Arc<ServiceRegistry>,
    backend: BackendClient,
    strategy: RwLock<SelectionStrategy>,
    cold_start_wait: Duration,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<Supervisor>, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            supervisor,
            registry,
            backend: BackendClient::new(),
            strategy: RwLock::new(SelectionStrategy::RoundRobin),
            cold_start_wait: COLD_START_WAIT,
        }
    }

    /// Current instance selection strategy.
    pub fn strategy(&self) -> SelectionStrategy {
        *self.strategy.read()
    }

    /// Replace the instance selection strategy.
    pub fn set_strategy(&self, strategy: SelectionStrategy) {
        *self.strategy.write() = strategy;
    }

    /// Dispatch one completion to the named model.
    pub async fn chat(
        &self,
        model: &str,
        prompt: String,
        max_tokens: u32,
        temperature: Option<f64>,
        top_p: Option<f64>,
    ) -> Result<ChatOutcome> {
        self.supervisor.ensure(model).await?;
        self.supervisor
            .wait_ready(model, self.cold_start_wait)
            .await?;

        let service = service_name(model);
        let request = CompletionRequest {
            prompt: prompt.clone(),
            n_predict: max_tokens,
            temperature: Some(temperature.unwrap_or(0.7)),
            top_p: Some(top_p.unwrap_or(0.9)),
            stop: STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
        };
        let strategy = self.strategy();

        let mut last_err = None;
        for attempt in 0..2 {
            let instance = self.registry.pick(&service, strategy)?;
            let _inflight = self.registry.begin_request(&service, &instance.id);
            debug!(
                model = %model,
                instance = %instance.id,
                attempt,
                "Forwarding completion"
            );

            match self
                .backend
                .completion(&instance.host, instance.port, &request)
                .await
            {
                Ok(response) => {
                    self.registry.touch_used(&service, &instance.id);

                    let content = response.content.trim().to_string();
                    let mut tokens_used = response.total_tokens() as i64;
                    if tokens_used == 0 {
                        // backend omitted its counters
                        tokens_used = estimate_tokens(&prompt) + estimate_tokens(&content);
                    }

                    return Ok(ChatOutcome {
                        content,
                        tokens_used,
                        model: model.to_string(),
                        port: instance.port,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        model = %model,
                        instance = %instance.id,
                        error = %e,
                        "Completion transport failure, demoting instance"
                    );
                    self.registry.force_unhealthy(&service, &instance.id);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.expect("retry loop records an error before exiting"))
    }
}
