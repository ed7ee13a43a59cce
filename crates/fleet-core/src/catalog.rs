//! Declarative model catalog
//!
//! The catalog is a JSON file listing every model the node may serve,
//! together with the hyperparameters used to launch its backend process.
//! It is parsed once at startup; the handle allows replacement under an
//! exclusive lock if an operator reloads it.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Documented backend sampling defaults. Values matching these are not
/// passed on the child command line.
pub const DEFAULT_TEMPERATURE: f64 = 0.8;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_REPEAT_PENALTY: f64 = 1.0;

/// Declaration of a single servable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    /// Unique model name (catalog key)
    pub model_name: String,

    /// Weights file name
    pub model_file: String,

    /// Directory containing the weights file
    pub model_path: String,

    /// Context window passed to the backend (`-c`)
    pub context_length: u32,

    /// Default completion budget for requests that do not set one
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f64,

    /// CPU threads for the backend (`-t`)
    pub threads: u32,

    /// Layers offloaded to GPU (`-ngl`), 0 for CPU-only
    #[serde(default)]
    pub gpu_layers: u32,

    /// Inactive models are listed nowhere and cannot be started
    pub active: bool,

    #[serde(default)]
    pub description: String,
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_top_p() -> f64 {
    DEFAULT_TOP_P
}

fn default_repeat_penalty() -> f64 {
    DEFAULT_REPEAT_PENALTY
}

impl ModelSpec {
    /// Full path to the weights file.
    pub fn weights_path(&self) -> String {
        format!("{}/{}", self.model_path, self.model_file)
    }
}

/// The parsed model catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub models: Vec<ModelSpec>,
}

impl ModelCatalog {
    /// Load and parse the catalog file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read catalog {}: {}", path.display(), e))
        })?;
        let catalog: ModelCatalog = serde_json::from_str(&data).map_err(|e| {
            Error::config(format!("failed to parse catalog {}: {}", path.display(), e))
        })?;
        Ok(catalog)
    }

    /// All models with the active flag set.
    pub fn list_active(&self) -> Vec<ModelSpec> {
        self.models.iter().filter(|m| m.active).cloned().collect()
    }

    /// Look up an active model by name.
    pub fn find_active(&self, name: &str) -> Result<ModelSpec> {
        self.models
            .iter()
            .find(|m| m.model_name == name && m.active)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("model {} not found or inactive", name)))
    }
}

/// Shared handle over the catalog, replaceable under an exclusive lock.
#[derive(Debug, Default)]
pub struct CatalogHandle {
    inner: RwLock<ModelCatalog>,
}

impl CatalogHandle {
    pub fn new(catalog: ModelCatalog) -> Self {
        Self {
            inner: RwLock::new(catalog),
        }
    }

    /// Load the catalog from disk and wrap it in a handle.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(ModelCatalog::load(path)?))
    }

    pub fn list_active(&self) -> Vec<ModelSpec> {
        self.inner.read().list_active()
    }

    pub fn find_active(&self, name: &str) -> Result<ModelSpec> {
        self.inner.read().find_active(name)
    }

    /// Replace the whole catalog.
    pub fn replace(&self, catalog: ModelCatalog) {
        *self.inner.write() = catalog;
    }

    pub fn snapshot(&self) -> ModelCatalog {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CATALOG_JSON: &str = r#"{
        "models": [
            {
                "modelName": "qwen2-7b-instruct",
                "modelFile": "qwen2-7b-instruct-q4_k_m.gguf",
                "modelPath": "/srv/models",
                "contextLength": 4096,
                "maxTokens": 512,
                "temperature": 0.7,
                "topP": 0.9,
                "repeatPenalty": 1.1,
                "threads": 8,
                "gpuLayers": 0,
                "active": true,
                "description": "general chat model"
            },
            {
                "modelName": "phi-3-mini",
                "modelFile": "phi-3-mini-q8_0.gguf",
                "modelPath": "/srv/models",
                "contextLength": 2048,
                "maxTokens": 256,
                "threads": 4,
                "active": false
            }
        ]
    }"#;

    fn write_catalog(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_catalog() {
        let file = write_catalog(CATALOG_JSON);
        let catalog = ModelCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.models.len(), 2);
        assert_eq!(catalog.models[0].model_name, "qwen2-7b-instruct");
        assert_eq!(catalog.models[0].context_length, 4096);
    }

    #[test]
    fn test_sampling_defaults_applied() {
        let file = write_catalog(CATALOG_JSON);
        let catalog = ModelCatalog::load(file.path()).unwrap();
        // phi-3-mini omits sampling fields entirely
        let phi = &catalog.models[1];
        assert_eq!(phi.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(phi.top_p, DEFAULT_TOP_P);
        assert_eq!(phi.repeat_penalty, DEFAULT_REPEAT_PENALTY);
        assert_eq!(phi.gpu_layers, 0);
    }

    #[test]
    fn test_list_active_filters_inactive() {
        let file = write_catalog(CATALOG_JSON);
        let catalog = ModelCatalog::load(file.path()).unwrap();
        let active = catalog.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].model_name, "qwen2-7b-instruct");
    }

    #[test]
    fn test_find_active() {
        let file = write_catalog(CATALOG_JSON);
        let catalog = ModelCatalog::load(file.path()).unwrap();

        assert!(catalog.find_active("qwen2-7b-instruct").is_ok());
        // present but inactive
        assert!(catalog.find_active("phi-3-mini").is_err());
        // absent
        assert!(catalog.find_active("missing").is_err());
    }

    #[test]
    fn test_weights_path() {
        let file = write_catalog(CATALOG_JSON);
        let catalog = ModelCatalog::load(file.path()).unwrap();
        assert_eq!(
            catalog.models[0].weights_path(),
            "/srv/models/qwen2-7b-instruct-q4_k_m.gguf"
        );
    }

    #[test]
    fn test_parse_error() {
        let file = write_catalog("{ not json");
        assert!(ModelCatalog::load(file.path()).is_err());
    }

    #[test]
    fn test_empty_catalog_is_not_fatal() {
        let file = write_catalog(r#"{"models": []}"#);
        let catalog = ModelCatalog::load(file.path()).unwrap();
        assert!(catalog.list_active().is_empty());
    }

    #[test]
    fn test_handle_replace() {
        let file = write_catalog(CATALOG_JSON);
        let handle = CatalogHandle::load(file.path()).unwrap();
        assert_eq!(handle.list_active().len(), 1);

        handle.replace(ModelCatalog::default());
        assert!(handle.list_active().is_empty());
    }
}
