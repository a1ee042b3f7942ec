//! AI-driven synthesis over a phase's successful results

use super::ReduceSummary;
use crate::error::{EngineError, Result};
use crate::interpreter;
use crate::invoker::{InvokeRequest, TransformInvoker};
use crate::mapper::MapResult;
use crate::template::{self, substitute_all};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Settings for a synthesis reduce
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub prompt: String,
    /// Named parameters substituted after the reserved placeholders
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Declared fields; `None` returns the reply as text
    #[serde(default)]
    pub output_fields: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl SynthesisConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

fn results_array(results: &[MapResult]) -> Value {
    Value::Array(
        results
            .iter()
            .filter(|r| r.success)
            .map(|r| {
                json!({
                    "id": r.id(),
                    "input": r.item.payload,
                    "output": r.output_value(),
                })
            })
            .collect(),
    )
}

fn write_results_file(results_json: &str) -> std::io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("batchmill-results-")
        .suffix(".json")
        .tempfile()?;
    file.write_all(results_json.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn synthesis_error(phase: &str, message: impl Into<String>, raw_response: Option<String>) -> EngineError {
    EngineError::Synthesis {
        phase: phase.to_string(),
        message: message.into(),
        raw_response,
    }
}

/// Build the prompt, invoke once and interpret the reply.
///
/// The results file, when one is used, is deleted before this returns.
pub async fn synthesize(
    phase: &str,
    config: &SynthesisConfig,
    results: &[MapResult],
    summary: &ReduceSummary,
    invoker: &dyn TransformInvoker,
) -> Result<(String, Option<Map<String, Value>>)> {
    let results_json = serde_json::to_string_pretty(&results_array(results))?;
    let mut prompt = config.prompt.clone();

    let results_file = if prompt.contains(&format!("{{{{{}}}}}", template::RESULTS_FILE)) {
        let file = write_results_file(&results_json)
            .map_err(|e| synthesis_error(phase, format!("failed to write results file: {}", e), None))?;
        let path = file.path().display().to_string();
        debug!(phase = %phase, path = %path, "Wrote results file");
        prompt = substitute_all(&prompt, template::RESULTS_FILE, &path);
        Some(file)
    } else {
        None
    };

    prompt = substitute_all(&prompt, template::RESULTS, &results_json);
    prompt = substitute_all(&prompt, template::COUNT, &summary.total.to_string());
    prompt = substitute_all(&prompt, template::SUCCESS_COUNT, &summary.succeeded.to_string());
    prompt = substitute_all(&prompt, template::FAILURE_COUNT, &summary.failed.to_string());
    for (name, value) in &config.params {
        prompt = substitute_all(&prompt, name, value);
    }

    let request = InvokeRequest::new(prompt)
        .with_model(config.model.clone())
        .with_timeout(config.timeout);
    let outcome = invoker.invoke(request).await;

    if let Some(file) = results_file {
        if let Err(e) = file.close() {
            warn!(phase = %phase, "Failed to remove results file: {}", e);
        }
    }

    let response = outcome.map_err(|e| synthesis_error(phase, format!("{:#}", e), None))?;
    if !response.success {
        let message = response
            .error
            .unwrap_or_else(|| "transform reported failure without a diagnostic".to_string());
        return Err(synthesis_error(phase, message, response.response));
    }

    let text = response.response.unwrap_or_default();
    if text.trim().is_empty() {
        return Err(synthesis_error(phase, "transform returned an empty response", Some(text)));
    }

    match &config.output_fields {
        Some(fields) if !fields.is_empty() => match interpreter::interpret(&text, fields) {
            Ok(output) => Ok((text, Some(output))),
            Err(e) => Err(synthesis_error(phase, e.to_string(), Some(text))),
        },
        _ => Ok((text, None)),
    }
}
