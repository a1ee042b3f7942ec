//! Transform invocation abstraction
//!
//! The engine never inspects how a prompt is executed. Any backend (an AI
//! CLI subprocess, an HTTP client, a test stub) implements
//! [`TransformInvoker`] and is injected into [`Engine`](crate::pipeline::Engine).

mod command;

pub use command::{CommandInvoker, CommandInvokerConfig};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single prompt execution request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub timeout: Option<Duration>,
}

impl InvokeRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            timeout: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Token accounting reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Outcome of an invocation the backend completed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeResponse {
    pub success: bool,
    pub response: Option<String>,
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

impl InvokeResponse {
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Trait for prompt execution backends.
///
/// `Err` is reserved for failures the backend could not describe as a
/// response (spawn errors, transport panics converted to errors); both forms
/// become a failed [`MapResult`](crate::mapper::MapResult).
#[async_trait]
pub trait TransformInvoker: Send + Sync {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse>;
}
