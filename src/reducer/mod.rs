//! Reducers combine a phase's map results into one artifact
//!
//! Deterministic formatters never fail. Synthesis makes one more model call
//! over the successful outputs and its failure is fatal to the phase.

pub mod formatters;
pub mod synthesis;

pub use synthesis::SynthesisConfig;

use crate::error::Result;
use crate::invoker::TransformInvoker;
use crate::mapper::MapResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Built-in output formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceFormat {
    #[default]
    List,
    Table,
    Json,
    Csv,
    Text,
}

impl fmt::Display for ReduceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::List => "list",
            Self::Table => "table",
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

impl FromStr for ReduceFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "list" => Ok(Self::List),
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "text" => Ok(Self::Text),
            other => Err(format!("unknown reduce format '{}'", other)),
        }
    }
}

/// How a phase turns its results into an artifact
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceStrategy {
    Format(ReduceFormat),
    Synthesize(SynthesisConfig),
}

impl Default for ReduceStrategy {
    fn default() -> Self {
        Self::Format(ReduceFormat::default())
    }
}

/// Success and failure counts over a phase's results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl ReduceSummary {
    pub fn from_results(results: &[MapResult]) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceOutput {
    pub results: Vec<MapResult>,
    pub formatted_output: String,
    /// Parsed synthesis fields (structured synthesis only)
    pub structured_output: Option<Map<String, Value>>,
    pub summary: ReduceSummary,
}

/// Reduce a phase's results, ordering them by ordinal first
pub async fn reduce(
    phase: &str,
    strategy: &ReduceStrategy,
    mut results: Vec<MapResult>,
    invoker: &dyn TransformInvoker,
) -> Result<ReduceOutput> {
    results.sort_by_key(|r| r.item.ordinal);
    let summary = ReduceSummary::from_results(&results);

    let (formatted_output, structured_output) = match strategy {
        ReduceStrategy::Format(format) => {
            info!(phase = %phase, format = %format, "Formatting {} results", summary.total);
            (formatters::format(*format, &results, &summary), None)
        }
        ReduceStrategy::Synthesize(config) => {
            info!(
                phase = %phase,
                "Synthesizing {} successful results",
                summary.succeeded
            );
            synthesis::synthesize(phase, config, &results, &summary, invoker).await?
        }
    };

    Ok(ReduceOutput {
        results,
        formatted_output,
        structured_output,
        summary,
    })
}
