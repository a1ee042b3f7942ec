use super::{InvokeRequest, InvokeResponse, TransformInvoker};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

fn default_model_flag() -> String {
    "--model".to_string()
}

/// Subprocess invoker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInvokerConfig {
    /// Program to run, e.g. `claude`
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Flag preceding the model name when a request carries one
    #[serde(default = "default_model_flag")]
    pub model_flag: String,
}

impl CommandInvokerConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            model_flag: default_model_flag(),
        }
    }
}

/// Runs a program per request, prompt on stdin, reply on stdout
pub struct CommandInvoker {
    config: CommandInvokerConfig,
}

impl CommandInvoker {
    pub fn new(config: CommandInvokerConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, request: &InvokeRequest) -> Vec<String> {
        let mut args = self.config.args.clone();
        if let Some(model) = request.model.as_deref().filter(|m| !m.is_empty()) {
            args.push(self.config.model_flag.clone());
            args.push(model.to_string());
        }
        args
    }

    async fn run(&self, request: &InvokeRequest) -> Result<InvokeResponse> {
        let args = self.build_args(request);
        debug!(program = %self.config.program, ?args, "Spawning invoker process");

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.program))?;

        // stdin must be fed while stdout is drained
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!("Invoker process closed stdin early: {}", e);
                }
                stdin.shutdown().await.ok();
            });
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for invoker process")?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            Ok(InvokeResponse::ok(stdout))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Ok(InvokeResponse {
                success: false,
                response: (!stdout.is_empty()).then_some(stdout),
                error: Some(format!(
                    "{} exited with {}: {}",
                    self.config.program,
                    code,
                    stderr.trim()
                )),
                ..Default::default()
            })
        }
    }
}

#[async_trait]
impl TransformInvoker for CommandInvoker {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse> {
        match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run(&request)).await {
                Ok(result) => result,
                Err(_) => Ok(InvokeResponse::failed(format!(
                    "{} timed out after {}",
                    self.config.program,
                    humanize(limit)
                ))),
            },
            None => self.run(&request).await,
        }
    }
}

fn humanize(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_flag_appended() {
        let mut config = CommandInvokerConfig::new("claude");
        config.args = vec!["-p".to_string()];
        let invoker = CommandInvoker::new(config);

        let request = InvokeRequest::new("hi").with_model(Some("opus".to_string()));
        assert_eq!(invoker.build_args(&request), vec!["-p", "--model", "opus"]);

        let request = InvokeRequest::new("hi").with_model(Some(String::new()));
        assert_eq!(invoker.build_args(&request), vec!["-p"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prompt_round_trips_through_cat() {
        let invoker = CommandInvoker::new(CommandInvokerConfig::new("cat"));
        let response = invoker.invoke(InvokeRequest::new("hello")).await.unwrap();
        assert!(response.success);
        assert_eq!(response.response.as_deref(), Some("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_a_failed_response() {
        let mut config = CommandInvokerConfig::new("sleep");
        config.args = vec!["5".to_string()];
        let invoker = CommandInvoker::new(config);

        let request = InvokeRequest::new("").with_timeout(Some(Duration::from_millis(100)));
        let response = invoker.invoke(request).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("sleep timed out after 100ms"));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let invoker = CommandInvoker::new(CommandInvokerConfig::new("definitely-not-a-real-binary"));
        assert!(invoker.invoke(InvokeRequest::new("x")).await.is_err());
    }
}
