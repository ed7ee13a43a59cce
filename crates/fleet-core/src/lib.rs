//! # fleet-core
//!
//! Core types and utilities shared across the fleet control plane.
//!
//! This crate provides the foundational pieces used by every other fleet
//! component:
//!
//! - The model catalog (declarative model definitions loaded from JSON)
//! - Environment-driven configuration
//! - Instance and node state types
//! - A unified error type with HTTP status mapping

pub mod catalog;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types at the crate root
pub use catalog::{CatalogHandle, ModelCatalog, ModelSpec};
pub use config::Config;
pub use error::{Error, Result};
pub use types::{service_name, InstanceState, NodeRole};
