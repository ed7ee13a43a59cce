//! Service instance records

use chrono::{DateTime, Utc};
use fleet_core::InstanceState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One running backend process as seen by the registry.
///
/// The registry owns these records; the supervisor owns the actual process
/// handle. Callers always receive copies, never references into registry
/// storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Synthesized identity, stable for the lifetime of the record
    #[serde(default)]
    pub id: String,

    /// Service name this instance belongs to (`llm-model-<model>`)
    pub name: String,

    pub host: String,
    pub port: u16,

    #[serde(default = "starting_state")]
    pub status: InstanceState,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub last_check: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub last_used: DateTime<Utc>,

    /// Consecutive probe failures since the last success
    #[serde(default)]
    pub fail_count: u32,

    /// Requests dispatched to this instance over its lifetime
    #[serde(default)]
    pub usage_count: u64,

    /// Requests currently being served by this instance
    #[serde(default)]
    pub inflight: u32,
}

fn starting_state() -> InstanceState {
    InstanceState::Starting
}

impl ServiceInstance {
    /// Create a new instance record in the `Starting` state.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        metadata: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            name: name.into(),
            host: host.into(),
            port,
            status: InstanceState::Starting,
            metadata,
            registered_at: now,
            last_check: now,
            last_used: now,
            fail_count: 0,
            usage_count: 0,
            inflight: 0,
        }
    }

    /// `host:port` endpoint string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base HTTP URL for the backend.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Synthesize the identity for this record.
    pub(crate) fn synthesize_id(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.name,
            self.host,
            self.port,
            Utc::now().timestamp()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_instance_starts_in_starting() {
        let instance = ServiceInstance::new("llm-model-m1", "127.0.0.1", 8081, HashMap::new());
        assert_eq!(instance.status, InstanceState::Starting);
        assert_eq!(instance.fail_count, 0);
        assert_eq!(instance.inflight, 0);
        assert!(instance.id.is_empty());
    }

    #[test]
    fn test_endpoint_formatting() {
        let instance = ServiceInstance::new("llm-model-m1", "127.0.0.1", 8081, HashMap::new());
        assert_eq!(instance.endpoint(), "127.0.0.1:8081");
        assert_eq!(instance.base_url(), "http://127.0.0.1:8081");
    }

    #[test]
    fn test_id_synthesis_embeds_identity() {
        let instance = ServiceInstance::new("llm-model-m1", "127.0.0.1", 8081, HashMap::new());
        let id = instance.synthesize_id();
        assert!(id.starts_with("llm-model-m1-127.0.0.1-8081-"));
    }

    #[test]
    fn test_deserialize_minimal() {
        let instance: ServiceInstance = serde_json::from_str(
            r#"{"name": "llm-model-m1", "host": "127.0.0.1", "port": 8081}"#,
        )
        .unwrap();
        assert_eq!(instance.status, InstanceState::Starting);
        assert!(instance.metadata.is_empty());
    }
}
