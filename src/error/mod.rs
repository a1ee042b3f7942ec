//! Error types for the batch engine
//!
//! Two tiers of failure exist and are never conflated:
//!
//! - Item-level failures ([`TemplateError`], [`InterpretError`], invocation
//!   errors) are recovered into [`MapResult::error`](crate::mapper::MapResult)
//!   and counted in the phase summary.
//! - Phase-level failures ([`EngineError`]) propagate to the caller and carry
//!   an exit code for the binary.

use std::path::PathBuf;
use thiserror::Error;

/// Phase-level error for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Invalid prompt template: {0}")]
    Template(#[from] TemplateError),

    #[error("Synthesis failed in phase {phase}: {message}")]
    Synthesis {
        phase: String,
        message: String,
        /// Raw model reply when the failure happened while interpreting it
        raw_response: Option<String>,
    },

    #[error("Phase {phase} completed with {} failed item(s): {}", .failed_ids.len(), .failed_ids.join(", "))]
    StrictMode {
        phase: String,
        failed_ids: Vec<String>,
    },

    #[error("Phase {phase} cancelled after {completed} item(s)")]
    Cancelled { phase: String, completed: usize },

    #[error("Cache error at {path}: {message}")]
    Cache {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a cache error for a path
    pub fn cache(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Cache {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach a source error (only for variants that carry one)
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        match &mut self {
            Self::Config { source: src, .. } | Self::Cache { source: src, .. } => {
                *src = Some(source.into());
            }
            _ => {}
        }
        self
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 2,
            Self::Template(_) => 2,
            Self::Synthesis { .. } => 3,
            Self::StrictMode { .. } => 4,
            Self::Cancelled { .. } => 130,
            Self::Cache { .. } => 5,
            Self::Git(_) => 6,
            Self::Io(_) | Self::Json(_) => 1,
        }
    }
}

/// Result alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Prompt template failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("item {item_id} has no field '{field}' required by the template")]
    MissingField { item_id: String, field: String },
}

/// Response interpretation failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpretError {
    #[error("no parseable structure found in response")]
    NoStructure,

    #[error("result is an array, not an object")]
    ArrayResult,

    #[error("result is not an object (found {0})")]
    NotAnObject(String),

    #[error("none of the declared fields ({}) were found in response", .0.join(", "))]
    FieldsNotFound(Vec<String>),

    #[error("malformed structure: {0}")]
    Malformed(String),
}
