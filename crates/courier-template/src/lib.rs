//! Courier Template Subsystem
//!
//! - TemplateStore: read-through cache keyed by (type, language) with
//!   default-language fallback and LRU/TTL bounds
//! - TemplateRenderer: `{{name}}` substitution with HTML escaping and a
//!   bounded rendered-output cache
//! - TemplateWarmer: startup warm-up of critical templates with bounded
//!   parallelism

pub mod render;
pub mod repository;
pub mod store;
pub mod warmup;

use std::collections::BTreeSet;
use thiserror::Error;

pub use render::{RenderedCache, TemplateRenderer, RendererConfig};
pub use repository::{InMemoryTemplateRepository, TemplateRepository};
pub use store::{TemplateStore, TemplateStoreConfig};
pub use warmup::{TemplateWarmer, WarmupProgress};

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Template not found: {notification_type}/{language}")]
    NotFound {
        notification_type: String,
        language: String,
    },

    #[error("Missing template variables: {}", names.iter().cloned().collect::<Vec<_>>().join(", "))]
    MissingVariables { names: BTreeSet<String> },

    #[error("Template body must not be empty")]
    EmptyBody,

    #[error("Repository error: {0}")]
    Repository(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TemplateError>;
