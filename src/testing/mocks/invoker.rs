//! Mock transform invoker for testing

use crate::invoker::{InvokeRequest, InvokeResponse, TransformInvoker};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Reply {
    Success(String),
    /// Backend-reported failure
    Failure(String),
    /// `Err` from `invoke`
    Error(String),
}

/// Builder for creating configured mock invokers
pub struct MockInvokerBuilder {
    rules: Vec<(String, Reply)>,
    default_reply: Reply,
    delay: Option<Duration>,
}

impl MockInvokerBuilder {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_reply: Reply::Success("Mock response".to_string()),
            delay: None,
        }
    }

    /// Reply with `response` to prompts containing `pattern`
    pub fn with_success(mut self, pattern: &str, response: &str) -> Self {
        self.rules
            .push((pattern.to_string(), Reply::Success(response.to_string())));
        self
    }

    /// Report a failed invocation for prompts containing `pattern`
    pub fn with_error(mut self, pattern: &str, error: &str) -> Self {
        self.rules
            .push((pattern.to_string(), Reply::Failure(error.to_string())));
        self
    }

    /// Return `Err` for prompts containing `pattern`
    pub fn with_exception(mut self, pattern: &str, error: &str) -> Self {
        self.rules
            .push((pattern.to_string(), Reply::Error(error.to_string())));
        self
    }

    pub fn with_default(mut self, response: &str) -> Self {
        self.default_reply = Reply::Success(response.to_string());
        self
    }

    /// Hold every invocation open for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn build(self) -> MockInvoker {
        MockInvoker {
            rules: self.rules,
            default_reply: self.default_reply,
            delay: self.delay,
            call_count: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MockInvokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Scripted [`TransformInvoker`] that records calls and concurrency.
///
/// Rules are matched in insertion order against the prompt; the first rule
/// whose pattern is a substring wins.
pub struct MockInvoker {
    rules: Vec<(String, Reply)>,
    default_reply: Reply,
    delay: Option<Duration>,
    call_count: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    requests: Mutex<Vec<InvokeRequest>>,
}

impl MockInvoker {
    pub fn builder() -> MockInvokerBuilder {
        MockInvokerBuilder::new()
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously unresolved invocations observed
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<InvokeRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.prompt).collect()
    }

    fn reply_for(&self, prompt: &str) -> Reply {
        self.rules
            .iter()
            .find(|(pattern, _)| prompt.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

#[async_trait]
impl TransformInvoker for MockInvoker {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self.reply_for(&request.prompt);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Reply::Success(text) => Ok(InvokeResponse::ok(text)),
            Reply::Failure(error) => Ok(InvokeResponse::failed(error)),
            Reply::Error(error) => Err(anyhow::anyhow!(error)),
        }
    }
}
