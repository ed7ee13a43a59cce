//! Opaque reverse proxy to backend instances
//!
//! Forwards raw HTTP requests to a chosen backend, rewriting the URL by
//! stripping the route prefix from the parsed path (never by substring
//! replacement, which would corrupt paths that merely contain the model
//! name). Clients are cached per `(host, port)` and pruned once their
//! target is no longer healthy; identity is deliberately not the instance
//! id, which can be reused across restarts.

use bytes::Bytes;
use fleet_core::{Error, Result};
use fleet_registry::{ServiceInstance, ServiceRegistry};
use http_body_util::{BodyExt, Full};
use hyper::Uri;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// How often stale proxy clients are pruned.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(600);

type ProxyClient = Client<HttpConnector, Full<Bytes>>;

/// Cache of per-target HTTP clients used for opaque forwarding.
pub struct ProxyCache {
    registry: Arc<ServiceRegistry>,
    clients: RwLock<HashMap<String, ProxyClient>>,
}

impl ProxyCache {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn client_for(&self, endpoint: &str) -> ProxyClient {
        if let Some(client) = self.clients.read().get(endpoint) {
            return client.clone();
        }

        let mut clients = self.clients.write();
        clients
            .entry(endpoint.to_string())
            .or_insert_with(|| Client::builder(TokioExecutor::new()).build_http())
            .clone()
    }

    /// Forward a raw request to `instance`, preserving method, headers, and
    /// body. `stripped_path` is the remainder of the URL after the proxy
    /// route prefix; the query string is carried over.
    pub async fn forward(
        &self,
        instance: &ServiceInstance,
        request: axum::extract::Request,
        stripped_path: &str,
        client_ip: &str,
    ) -> Result<axum::response::Response> {
        let path = if stripped_path.starts_with('/') {
            stripped_path.to_string()
        } else {
            format!("/{}", stripped_path)
        };
        let path_and_query = match request.uri().query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };

        let uri: Uri = format!("http://{}{}", instance.endpoint(), path_and_query)
            .parse()
            .map_err(|e| Error::invalid_request(format!("invalid proxy path: {}", e)))?;

        let original_host = request
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        // collect the inbound body so it can be replayed to the target
        let (mut parts, body) = request.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| Error::invalid_request(format!("failed to read request body: {}", e)))?
            .to_bytes();

        parts.uri = uri;
        parts
            .headers
            .insert("x-forwarded-host", header_value(&original_host));
        parts
            .headers
            .insert("x-forwarded-proto", header_value("http"));
        parts.headers.insert("x-real-ip", header_value(client_ip));
        parts.headers.insert(
            "x-request-id",
            header_value(&format!("req-{}", Uuid::new_v4())),
        );

        let outbound = hyper::Request::from_parts(parts, Full::new(body_bytes));
        let endpoint = instance.endpoint();
        debug!(target = %endpoint, "Proxying request");

        match self.client_for(&endpoint).request(outbound).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Ok(axum::response::Response::from_parts(
                    parts,
                    axum::body::Body::new(body),
                ))
            }
            Err(e) => {
                warn!(
                    target = %endpoint,
                    instance = %instance.id,
                    error = %e,
                    "Proxy transport failure, demoting instance"
                );
                self.registry.force_unhealthy(&instance.name, &instance.id);
                Err(Error::backend(format!(
                    "proxy to {} failed: {}",
                    endpoint, e
                )))
            }
        }
    }

    /// Drop cached clients whose target is no longer a healthy instance.
    pub fn prune(&self) -> usize {
        let healthy: std::collections::HashSet<String> = self
            .registry
            .all_services()
            .values()
            .flatten()
            .filter(|i| i.status.is_routable())
            .map(|i| i.endpoint())
            .collect();

        let mut clients = self.clients.write();
        let before = clients.len();
        clients.retain(|endpoint, _| healthy.contains(endpoint));
        let pruned = before - clients.len();
        if pruned > 0 {
            debug!(pruned, "Pruned stale proxy clients");
        }
        pruned
    }

    /// Number of cached clients.
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic prune task.
    pub fn spawn_janitor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.prune();
            }
        })
    }
}

fn header_value(value: &str) -> hyper::header::HeaderValue {
    hyper::header::HeaderValue::from_str(value)
        .unwrap_or_else(|_| hyper::header::HeaderValue::from_static(""))
}
