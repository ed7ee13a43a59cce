//! Environment-driven configuration
//!
//! Every knob can come from the environment; a YAML file may supply the same
//! fields for deployments that prefer config files. CLI flags in the binary
//! override both.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection string for the external user/call store
    pub database_url: String,

    /// Secret consumed by the upstream authenticator
    pub jwt_secret: String,

    /// "development" or "production"
    pub environment: String,

    /// Price per token, used by billing reports
    pub token_rate: f64,

    /// Token grant for newly registered users
    pub default_tokens: i64,

    /// Path to the llama.cpp server binary
    pub llama_cpp_path: String,

    /// Directory holding model weights
    pub models_path: String,

    /// Path to the model catalog JSON file
    pub model_config_path: String,

    /// Port the gateway HTTP server binds
    pub server_port: u16,

    /// First port handed to backend processes
    pub llama_cpp_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite3://./llm.db".to_string(),
            jwt_secret: "change-me-in-production".to_string(),
            environment: "development".to_string(),
            token_rate: 0.001,
            default_tokens: 1000,
            llama_cpp_path: "../llama.cpp/build/bin/llama-server".to_string(),
            models_path: "../models".to_string(),
            model_config_path: "../models/model_config.json".to_string(),
            server_port: 8080,
            llama_cpp_port: 8081,
        }
    }
}

impl Config {
    /// Build a configuration from the process environment, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            database_url: env_or("DATABASE_URL", defaults.database_url),
            jwt_secret: env_or("JWT_SECRET", defaults.jwt_secret),
            environment: env_or("ENVIRONMENT", defaults.environment),
            token_rate: env_parse_or("TOKEN_RATE", defaults.token_rate),
            default_tokens: env_parse_or("DEFAULT_TOKENS", defaults.default_tokens),
            llama_cpp_path: env_or("LLAMA_CPP_PATH", defaults.llama_cpp_path),
            models_path: env_or("MODELS_PATH", defaults.models_path),
            model_config_path: env_or("MODEL_CONFIG_PATH", defaults.model_config_path),
            server_port: env_parse_or("SERVER_PORT", defaults.server_port),
            llama_cpp_port: env_parse_or("LLAMA_CPP_PORT", defaults.llama_cpp_port),
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&data)?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn env_or(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
