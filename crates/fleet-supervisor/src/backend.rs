//! HTTP client for the backend completion protocol
//!
//! Backends expose `POST /completion` and `GET /health`. This client is the
//! single place that speaks that protocol; the supervisor uses it for
//! readiness probes and the dispatcher for typed completion calls.

use bytes::Bytes;
use fleet_core::{Error, Result};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Default bound on a completion call.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on a readiness/health probe.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Request body for the backend `/completion` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub n_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// Response body from the backend `/completion` endpoint.
///
/// Token counters default to zero when the backend omits them; callers
/// fall back to estimation in that case.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tokens_evaluated: u32,
    #[serde(default)]
    pub tokens_predicted: u32,
    #[serde(default)]
    pub stopped_eos: bool,
}

impl CompletionResponse {
    /// Total tokens the backend reports for this call, or zero when it
    /// reported nothing.
    pub fn total_tokens(&self) -> u32 {
        self.tokens_evaluated + self.tokens_predicted
    }
}

/// Client for backend instances.
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: Client<HttpConnector, Full<Bytes>>,
    completion_timeout: Duration,
    health_timeout: Duration,
}

impl BackendClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }

    pub fn with_completion_timeout(mut self, completion_timeout: Duration) -> Self {
        self.completion_timeout = completion_timeout;
        self
    }

    pub fn with_health_timeout(mut self, health_timeout: Duration) -> Self {
        self.health_timeout = health_timeout;
        self
    }

    /// Issue a completion call against a backend.
    pub async fn completion(
        &self,
        host: &str,
        port: u16,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        let uri: Uri = format!("http://{}:{}/completion", host, port)
            .parse()
            .map_err(|e| Error::internal(format!("invalid completion uri: {}", e)))?;

        let body = serde_json::to_vec(request)?;
        let http_request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::internal(format!("failed to build request: {}", e)))?;

        debug!(host = %host, port, n_predict = request.n_predict, "Sending completion request");

        let response = timeout(self.completion_timeout, self.client.request(http_request))
            .await
            .map_err(|_| Error::timeout(format!("completion call to {}:{}", host, port)))?
            .map_err(|e| Error::backend(format!("completion call to {}:{} failed: {}", host, port, e)))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::backend(format!("failed to read completion response: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(Error::backend(format!(
                "backend returned {}: {}",
                status,
                String::from_utf8_lossy(&bytes)
            )));
        }

        let completion: CompletionResponse = serde_json::from_slice(&bytes)
            .map_err(|e| Error::backend(format!("failed to parse completion response: {}", e)))?;
        Ok(completion)
    }

    /// Probe the backend's `/health` endpoint. Any transport error or
    /// non-2xx answer counts as unhealthy.
    pub async fn health(&self, host: &str, port: u16) -> bool {
        let uri: Uri = match format!("http://{}:{}/health", host, port).parse() {
            Ok(uri) => uri,
            Err(_) => return false,
        };

        let request = match Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
        {
            Ok(request) => request,
            Err(_) => return false,
        };

        match timeout(self.health_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

impl Default for BackendClient {
    fn default() -> Self {
        Self::new()
    }
}
