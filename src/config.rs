//! Engine and pipeline configuration
//!
//! Settings come from a TOML pipeline file, then `BATCHMILL_*` environment
//! variables, then command-line flags, each layer overriding the previous.

use crate::error::{EngineError, Result};
use crate::invoker::CommandInvokerConfig;
use crate::mapper::DEFAULT_CONCURRENCY;
use crate::reducer::{ReduceFormat, ReduceStrategy, SynthesisConfig};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAP_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_REDUCE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default cache root under the platform data directory
pub fn default_cache_dir() -> PathBuf {
    ProjectDirs::from("com", "batchmill", "batchmill")
        .map(|dirs| dirs.data_dir().join("cache"))
        .unwrap_or_else(|| PathBuf::from(".batchmill").join("cache"))
}

/// Settings shared by every phase of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub concurrency: usize,
    /// Escalate any item failure to a phase failure
    pub strict: bool,
    /// Unknown template fields fail the item instead of rendering empty
    pub strict_templates: bool,
    #[serde(with = "humantime_serde")]
    pub map_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reduce_timeout: Duration,
    pub cache_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            strict: true,
            strict_templates: false,
            map_timeout: DEFAULT_MAP_TIMEOUT,
            reduce_timeout: DEFAULT_REDUCE_TIMEOUT,
            cache_dir: None,
            log_level: None,
        }
    }
}

impl EngineConfig {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn merge_env_vars(&mut self) {
        if let Ok(concurrency) = std::env::var("BATCHMILL_CONCURRENCY") {
            if let Ok(value) = concurrency.parse::<usize>() {
                self.concurrency = value;
            }
        }

        if let Ok(cache_dir) = std::env::var("BATCHMILL_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(cache_dir));
        }

        if let Ok(strict) = std::env::var("BATCHMILL_STRICT") {
            if let Ok(value) = strict.parse::<bool>() {
                self.strict = value;
            }
        }

        if let Ok(log_level) = std::env::var("BATCHMILL_LOG_LEVEL") {
            self.log_level = Some(log_level);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(EngineError::config("concurrency must be at least 1"));
        }
        Ok(())
    }
}

/// How a phase reduces its results; at most one of the two may be set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReduceConfig {
    #[serde(default)]
    pub format: Option<ReduceFormat>,
    #[serde(default)]
    pub synthesis: Option<SynthesisConfig>,
}

/// One split, map and reduce pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub prompt: String,
    /// Declared output fields; omitted for text mode
    #[serde(default)]
    pub output_fields: Option<Vec<String>>,
    /// Model name template, may reference item fields
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub id_field: Option<String>,
    #[serde(default)]
    pub reduce: ReduceConfig,
    /// Earlier phase whose per-item outputs feed this one
    #[serde(default)]
    pub depends_on: Option<String>,
}

impl PhaseConfig {
    pub fn reduce_strategy(&self) -> Result<ReduceStrategy> {
        match (&self.reduce.format, &self.reduce.synthesis) {
            (Some(_), Some(_)) => Err(EngineError::config(format!(
                "phase '{}' sets both a reduce format and a synthesis prompt",
                self.name
            ))),
            (_, Some(synthesis)) => Ok(ReduceStrategy::Synthesize(synthesis.clone())),
            (Some(format), None) => Ok(ReduceStrategy::Format(*format)),
            (None, None) => Ok(ReduceStrategy::default()),
        }
    }
}

/// A pipeline file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub invoker: Option<CommandInvokerConfig>,
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,
}

impl PipelineConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| EngineError::config("failed to parse pipeline file").with_source(e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("failed to read {}", path.display())).with_source(e)
        })?;
        Self::from_toml(&content)
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Phases must be uniquely named and may only depend on earlier phases
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        if self.phases.is_empty() {
            return Err(EngineError::config("pipeline defines no phases"));
        }

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return Err(EngineError::config("phase name must not be empty"));
            }
            if phase.prompt.trim().is_empty() {
                return Err(EngineError::config(format!("phase '{}' has an empty prompt", phase.name)));
            }
            if let Some(upstream) = &phase.depends_on {
                if !seen.contains(upstream.as_str()) {
                    return Err(EngineError::config(format!(
                        "phase '{}' depends on '{}', which is not an earlier phase",
                        phase.name, upstream
                    )));
                }
            }
            phase.reduce_strategy()?;
            if !seen.insert(phase.name.as_str()) {
                return Err(EngineError::config(format!("duplicate phase name '{}'", phase.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
[engine]
concurrency = 3
map_timeout = "30s"

[invoker]
program = "claude"
args = ["--print"]

[[phases]]
name = "analyze"
prompt = "Summarize {{path}}"
output_fields = ["summary", "risk"]

[phases.reduce]
format = "table"

[[phases]]
name = "report"
prompt = "Review {{analyze.summary}}"
depends_on = "analyze"

[phases.reduce.synthesis]
prompt = "Write a report from {{RESULTS}} for {{team}}"
timeout = "2m"

[phases.reduce.synthesis.params]
team = "platform"
"#;

    #[test]
    fn test_parse_pipeline() {
        let config = PipelineConfig::from_toml(PIPELINE).unwrap();
        assert_eq!(config.engine.concurrency, 3);
        assert_eq!(config.engine.map_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.reduce_timeout, DEFAULT_REDUCE_TIMEOUT);
        assert!(config.engine.strict);

        let invoker = config.invoker.as_ref().unwrap();
        assert_eq!(invoker.program, "claude");
        assert_eq!(invoker.model_flag, "--model");

        let analyze = config.phase("analyze").unwrap();
        assert_eq!(
            analyze.reduce_strategy().unwrap(),
            ReduceStrategy::Format(ReduceFormat::Table)
        );

        match config.phase("report").unwrap().reduce_strategy().unwrap() {
            ReduceStrategy::Synthesize(synthesis) => {
                assert_eq!(synthesis.params["team"], "platform");
                assert_eq!(synthesis.timeout, Some(Duration::from_secs(120)));
            }
            other => panic!("expected synthesis, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_forward_dependency() {
        let content = r#"
[[phases]]
name = "a"
prompt = "x"
depends_on = "b"

[[phases]]
name = "b"
prompt = "y"
"#;
        let err = PipelineConfig::from_toml(content).unwrap_err();
        assert!(err.to_string().contains("not an earlier phase"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_rejects_duplicate_and_conflicting_phases() {
        let duplicate = "[[phases]]\nname = \"a\"\nprompt = \"x\"\n[[phases]]\nname = \"a\"\nprompt = \"y\"\n";
        assert!(PipelineConfig::from_toml(duplicate).is_err());

        let conflicting = "[[phases]]\nname = \"a\"\nprompt = \"x\"\n[phases.reduce]\nformat = \"csv\"\n[phases.reduce.synthesis]\nprompt = \"s\"\n";
        assert!(PipelineConfig::from_toml(conflicting).is_err());

        assert!(PipelineConfig::from_toml("").is_err());
    }

    #[test]
    fn test_merge_env_vars() {
        let mut config = EngineConfig::default();

        std::env::set_var("BATCHMILL_CONCURRENCY", "9");
        std::env::set_var("BATCHMILL_CACHE_DIR", "/tmp/batchmill-env-cache");
        std::env::set_var("BATCHMILL_STRICT", "false");
        std::env::set_var("BATCHMILL_LOG_LEVEL", "debug");

        config.merge_env_vars();

        assert_eq!(config.concurrency, 9);
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/batchmill-env-cache"));
        assert!(!config.strict);
        assert_eq!(config.log_level.as_deref(), Some("debug"));

        std::env::remove_var("BATCHMILL_CONCURRENCY");
        std::env::remove_var("BATCHMILL_CACHE_DIR");
        std::env::remove_var("BATCHMILL_STRICT");
        std::env::remove_var("BATCHMILL_LOG_LEVEL");
    }
}
