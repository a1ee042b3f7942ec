//! Phase orchestration
//!
//! A phase splits its batch, asks the cache what must be (re)processed, maps
//! only that subset while saving each success as it lands, merges fresh and
//! cached results, reduces them and finally records the artifact and the
//! completion manifest.

use crate::cache::{
    plan_phase, CacheEntry, CacheManifest, CacheMode, CacheStore, ChangeDetector, DigestChangeDetector, PhaseArtifact,
    PhaseCache, PhaseCacheState, PlanRequest,
};
use crate::config::{EngineConfig, PhaseConfig};
use crate::error::{EngineError, Result};
use crate::fingerprint::{content_fingerprint, payload_digest};
use crate::invoker::TransformInvoker;
use crate::mapper::{
    CancelPredicate, CompletionCallback, MapHooks, MapResult, Mapper, MapperConfig, ProgressCallback,
    ProgressEvent, ProgressPhase,
};
use crate::reducer::{self, ReduceOutput, ReduceStrategy, ReduceSummary};
use crate::splitter::{split, BatchInput, WorkItem};
use crate::template::PromptTemplate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything that defines one phase
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSpec {
    pub name: String,
    pub template: PromptTemplate,
    pub output_fields: Option<Vec<String>>,
    pub model: Option<PromptTemplate>,
    pub id_field: Option<String>,
    pub reduce: ReduceStrategy,
    pub depends_on: Option<String>,
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>, template: impl Into<PromptTemplate>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            output_fields: None,
            model: None,
            id_field: None,
            reduce: ReduceStrategy::default(),
            depends_on: None,
        }
    }

    pub fn with_output_fields(mut self, fields: &[&str]) -> Self {
        self.output_fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn with_model(mut self, model: impl Into<PromptTemplate>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_reduce(mut self, reduce: ReduceStrategy) -> Self {
        self.reduce = reduce;
        self
    }

    pub fn with_depends_on(mut self, upstream: impl Into<String>) -> Self {
        self.depends_on = Some(upstream.into());
        self
    }

    pub fn from_config(config: &PhaseConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            template: PromptTemplate::new(config.prompt.clone()),
            output_fields: config.output_fields.clone(),
            model: config.model.clone().map(PromptTemplate::new),
            id_field: config.id_field.clone(),
            reduce: config.reduce_strategy()?,
            depends_on: config.depends_on.clone(),
        })
    }

    /// Digest of everything that shapes per-item results
    pub fn settings_digest(&self) -> String {
        let fields = self.output_fields.as_deref().unwrap_or_default().join("\u{1f}");
        let mode = if self.output_fields.is_some() { "structured" } else { "text" };
        let model = self.model.as_ref().map(|m| m.as_str()).unwrap_or_default();
        let upstream = self.depends_on.as_deref().unwrap_or_default();
        content_fingerprint([self.template.as_str(), mode, fields.as_str(), model, upstream])
    }

    /// Digest of the reduce strategy
    pub fn reduce_digest(&self) -> String {
        content_fingerprint([serde_json::to_string(&self.reduce).unwrap_or_default()])
    }
}

/// Per-item results of an upstream phase handed to a dependent one
#[derive(Debug, Clone, Default)]
pub struct Upstream {
    pub phase: String,
    /// Ids processed afresh upstream in this run
    pub changed: BTreeSet<String>,
    pub results: BTreeMap<String, MapResult>,
}

/// Per-run inputs and observers for a phase
#[derive(Clone, Default)]
pub struct RunContext {
    pub fingerprint: String,
    pub mode: CacheMode,
    pub upstream: Option<Upstream>,
    pub on_progress: Option<ProgressCallback>,
    pub is_cancelled: Option<CancelPredicate>,
}

impl RunContext {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_cancel(mut self, predicate: CancelPredicate) -> Self {
        self.is_cancelled = Some(predicate);
        self
    }

    /// Same run, fed by `outcome`'s per-item results
    pub fn depends_on(&self, outcome: &PhaseOutcome) -> Self {
        let mut next = self.clone();
        next.upstream = Some(Upstream {
            phase: outcome.phase.clone(),
            changed: outcome.fresh_ids.iter().cloned().collect(),
            results: outcome
                .output
                .results
                .iter()
                .map(|r| (r.id().to_string(), r.clone()))
                .collect(),
        });
        next
    }

    fn cancelled(&self) -> bool {
        self.is_cancelled.as_ref().is_some_and(|check| check())
    }

    fn progress(&self, event: ProgressEvent) {
        if let Some(callback) = &self.on_progress {
            callback(&event);
        }
    }
}

/// What a completed phase produced and how
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub phase: String,
    pub state: PhaseCacheState,
    pub output: ReduceOutput,
    /// Ids mapped in this run (including failures)
    pub fresh_ids: Vec<String>,
    pub failed_ids: Vec<String>,
    /// False when the cached artifact was reused
    pub reduced: bool,
    pub restamped: Vec<String>,
}

impl PhaseOutcome {
    pub fn invocations(&self) -> usize {
        self.fresh_ids.len()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactBody {
    formatted_output: String,
    structured_output: Option<Map<String, Value>>,
}

/// Runs phases against an injected invoker and a cache root
pub struct Engine {
    invoker: Arc<dyn TransformInvoker>,
    config: EngineConfig,
    store: CacheStore,
    detector: Arc<dyn ChangeDetector>,
}

impl Engine {
    pub fn new(invoker: Arc<dyn TransformInvoker>, config: EngineConfig) -> Self {
        let store = CacheStore::new(config.cache_dir());
        Self {
            invoker,
            config,
            store,
            detector: Arc::new(DigestChangeDetector),
        }
    }

    pub fn with_change_detector(mut self, detector: Arc<dyn ChangeDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Run phases in order, wiring each `depends_on` to its upstream outcome
    pub async fn run_pipeline(
        &self,
        phases: &[PhaseSpec],
        input: &BatchInput,
        ctx: &RunContext,
    ) -> Result<Vec<PhaseOutcome>> {
        let mut outcomes: Vec<PhaseOutcome> = Vec::with_capacity(phases.len());

        for spec in phases {
            let phase_ctx = match &spec.depends_on {
                Some(upstream) => {
                    let outcome = outcomes.iter().find(|o| &o.phase == upstream).ok_or_else(|| {
                        EngineError::config(format!(
                            "phase '{}' depends on '{}', which has not run",
                            spec.name, upstream
                        ))
                    })?;
                    ctx.depends_on(outcome)
                }
                None => ctx.clone(),
            };
            outcomes.push(self.run_phase(spec, input, &phase_ctx).await?);
        }
        Ok(outcomes)
    }

    /// Run one phase
    pub async fn run_phase(&self, spec: &PhaseSpec, input: &BatchInput, ctx: &RunContext) -> Result<PhaseOutcome> {
        let phase = spec.name.as_str();
        if ctx.cancelled() {
            return Err(EngineError::Cancelled {
                phase: phase.to_string(),
                completed: 0,
            });
        }

        let mut input = input.clone();
        if spec.id_field.is_some() {
            input.id_field = spec.id_field.clone();
        }
        let mut items = split(&input);
        if let Some(upstream) = &ctx.upstream {
            enrich_from_upstream(&mut items, upstream);
        }
        info!(phase = %phase, items = items.len(), "Starting phase");

        let cache = self.store.phase(phase);
        let settings_digest = spec.settings_digest();
        let no_upstream = BTreeSet::new();
        let upstream_changed = ctx.upstream.as_ref().map_or(&no_upstream, |u| &u.changed);

        let plan = plan_phase(
            &cache,
            self.detector.as_ref(),
            &PlanRequest {
                items: &items,
                fingerprint: &ctx.fingerprint,
                mode: ctx.mode,
                upstream_changed,
                settings_digest: &settings_digest,
            },
        );

        let restored = restore_results(phase, &items, &plan.cached);
        let to_map: Vec<WorkItem> = items
            .iter()
            .filter(|item| !restored.contains_key(&item.id))
            .cloned()
            .collect();
        debug!(
            phase = %phase,
            cached = restored.len(),
            to_map = to_map.len(),
            "Resolved cached results"
        );

        let mapper = Mapper::new(
            self.invoker.clone(),
            spec.template.clone(),
            MapperConfig {
                concurrency: self.config.concurrency,
                strict_templates: self.config.strict_templates,
                timeout: Some(self.config.map_timeout),
                model: spec.model.clone(),
                output_fields: spec.output_fields.clone(),
            },
        );
        let hooks = MapHooks {
            on_complete: Some(save_callback(cache.clone(), ctx.fingerprint.clone(), settings_digest.clone())),
            on_progress: ctx.on_progress.clone(),
            is_cancelled: ctx.is_cancelled.clone(),
        };

        let run = mapper.map_all(to_map, &hooks).await;
        if run.was_cancelled() {
            warn!(
                phase = %phase,
                completed = run.results.len(),
                skipped = run.skipped.len(),
                "Phase cancelled, manifest not written"
            );
            return Err(EngineError::Cancelled {
                phase: phase.to_string(),
                completed: run.results.len(),
            });
        }

        let fresh_ids: Vec<String> = run.results.iter().map(|r| r.id().to_string()).collect();
        let mut results: Vec<MapResult> = run.results;
        results.extend(restored.into_values());
        results.sort_by_key(|r| r.item.ordinal);

        let failed_ids: Vec<String> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.id().to_string())
            .collect();

        let reduce_digest = spec.reduce_digest();
        let result_ids: Vec<String> = results.iter().map(|r| r.id().to_string()).collect();
        let results_digest = results_digest(&results);
        let reusable = if fresh_ids.is_empty() && upstream_changed.is_empty() && ctx.mode != CacheMode::ForceInvalidate {
            cached_artifact(&cache, &ctx.fingerprint, &reduce_digest, &result_ids, &results_digest)
        } else {
            None
        };

        let (output, reduced) = match reusable {
            Some(body) => {
                info!(phase = %phase, "Reusing cached phase artifact");
                let summary = ReduceSummary::from_results(&results);
                let output = ReduceOutput {
                    results,
                    formatted_output: body.formatted_output,
                    structured_output: body.structured_output,
                    summary,
                };
                (output, false)
            }
            None => {
                ctx.progress(reducing_event(0));
                let reduce = match &spec.reduce {
                    ReduceStrategy::Synthesize(synthesis) if synthesis.timeout.is_none() => {
                        let mut synthesis = synthesis.clone();
                        synthesis.timeout = Some(self.config.reduce_timeout);
                        ReduceStrategy::Synthesize(synthesis)
                    }
                    other => other.clone(),
                };
                let output = reducer::reduce(phase, &reduce, results, self.invoker.as_ref()).await?;
                ctx.progress(reducing_event(1));
                let artifact = PhaseArtifact::new(&ctx.fingerprint, &reduce_digest, Value::Null)
                    .with_coverage(result_ids, results_digest);
                self.save_artifact(&cache, artifact, &output);
                (output, true)
            }
        };

        self.write_manifest(&cache, &ctx.fingerprint, &settings_digest, &items, &output.results);

        info!(
            phase = %phase,
            state = %plan.state,
            fresh = fresh_ids.len(),
            failed = failed_ids.len(),
            restamped = plan.restamped.len(),
            "Phase complete"
        );

        if self.config.strict && !failed_ids.is_empty() {
            return Err(EngineError::StrictMode {
                phase: phase.to_string(),
                failed_ids,
            });
        }

        Ok(PhaseOutcome {
            phase: phase.to_string(),
            state: plan.state,
            output,
            fresh_ids,
            failed_ids,
            reduced,
            restamped: plan.restamped,
        })
    }

    fn save_artifact(&self, cache: &PhaseCache, mut artifact: PhaseArtifact, output: &ReduceOutput) {
        let body = ArtifactBody {
            formatted_output: output.formatted_output.clone(),
            structured_output: output.structured_output.clone(),
        };
        let saved = serde_json::to_value(&body).map_err(EngineError::from).and_then(|value| {
            artifact.output = value;
            cache.save_artifact(&artifact)
        });
        if let Err(e) = saved {
            warn!(phase = %cache.phase(), "Failed to save phase artifact: {}", e);
        }
    }

    /// Record the successful ids as complete for `fingerprint`
    fn write_manifest(
        &self,
        cache: &PhaseCache,
        fingerprint: &str,
        settings_digest: &str,
        items: &[WorkItem],
        results: &[MapResult],
    ) {
        let succeeded: BTreeSet<&str> = results.iter().filter(|r| r.success).map(|r| r.id()).collect();

        let mut manifest = CacheManifest::new(fingerprint);
        manifest.settings_digest = Some(settings_digest.to_string());
        for item in items.iter().filter(|i| succeeded.contains(i.id.as_str())) {
            manifest.item_ids.push(item.id.clone());
            manifest
                .item_digests
                .insert(item.id.clone(), payload_digest(&item.payload));
        }

        if let Err(e) = cache.write_manifest(&manifest) {
            warn!(phase = %cache.phase(), "Failed to write cache manifest: {}", e);
        }
    }
}

fn reducing_event(completed: usize) -> ProgressEvent {
    ProgressEvent {
        phase: ProgressPhase::Reducing,
        completed_items: completed,
        total_items: 1,
        failed_items: 0,
    }
}

/// Saves each successful result under the run's fingerprint, with the
/// digests of the payload and settings it was computed from
fn save_callback(cache: PhaseCache, fingerprint: String, settings_digest: String) -> CompletionCallback {
    Arc::new(move |item: &WorkItem, result: &MapResult| -> anyhow::Result<()> {
        if !result.success {
            return Ok(());
        }
        let entry = CacheEntry::new(&item.id, &fingerprint, serde_json::to_value(result)?)
            .with_digests(payload_digest(&item.payload), &settings_digest);
        cache.put_entry(&entry)?;
        Ok(())
    })
}

/// Digest over everything a reducer reads from the merged results
fn results_digest(results: &[MapResult]) -> String {
    let parts: Vec<String> = results
        .iter()
        .map(|r| {
            format!(
                "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
                r.id(),
                payload_digest(&r.item.payload),
                r.success,
                r.output_value(),
                r.error.as_deref().unwrap_or_default()
            )
        })
        .collect();
    content_fingerprint(parts)
}

/// Decode cached entries into results bound to the current items
fn restore_results(
    phase: &str,
    items: &[WorkItem],
    cached: &BTreeMap<String, CacheEntry>,
) -> BTreeMap<String, MapResult> {
    let mut restored = BTreeMap::new();
    for item in items {
        let Some(entry) = cached.get(&item.id) else {
            continue;
        };
        match serde_json::from_value::<MapResult>(entry.payload.clone()) {
            Ok(mut result) if result.success => {
                result.item = item.clone();
                result.cached = true;
                restored.insert(item.id.clone(), result);
            }
            Ok(_) => debug!(phase = %phase, item_id = %item.id, "Cached entry is a failure, remapping"),
            Err(e) => warn!(phase = %phase, item_id = %item.id, "Undecodable cache entry, remapping: {}", e),
        }
    }
    restored
}

/// The stored reduce output, when it was produced from exactly `result_ids`
/// with these results and reduce settings. An artifact from an earlier
/// fingerprint is re-stamped on reuse.
fn cached_artifact(
    cache: &PhaseCache,
    fingerprint: &str,
    reduce_digest: &str,
    result_ids: &[String],
    results_digest: &str,
) -> Option<ArtifactBody> {
    let mut artifact = cache.load_artifact()?;
    if artifact.reduce_digest.as_deref() != Some(reduce_digest) {
        debug!(phase = %cache.phase(), "Reduce settings changed, artifact not reusable");
        return None;
    }
    if !artifact.covers(result_ids, results_digest) {
        debug!(
            phase = %cache.phase(),
            reduced = artifact.item_ids.len(),
            current = result_ids.len(),
            "Artifact was reduced from other results, not reusable"
        );
        return None;
    }

    let body = match serde_json::from_value::<ArtifactBody>(artifact.output.clone()) {
        Ok(body) => body,
        Err(e) => {
            warn!(phase = %cache.phase(), "Ignoring undecodable phase artifact: {}", e);
            return None;
        }
    };

    if artifact.fingerprint != fingerprint {
        artifact.fingerprint = fingerprint.to_string();
        if let Err(e) = cache.save_artifact(&artifact) {
            warn!(phase = %cache.phase(), "Failed to re-stamp phase artifact: {}", e);
        }
    }
    Some(body)
}

/// Expose upstream outputs as `<phase>.<field>` payload fields
fn enrich_from_upstream(items: &mut [WorkItem], upstream: &Upstream) {
    for item in items.iter_mut() {
        let Some(result) = upstream.results.get(&item.id).filter(|r| r.success) else {
            continue;
        };
        for (field, value) in result.output_fields() {
            let rendered = match value {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            item.payload.insert(format!("{}.{}", upstream.phase, field), rendered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::ReduceFormat;
    use crate::testing::{batch_of, mocks::MockInvoker};
    use tempfile::TempDir;

    fn engine(invoker: Arc<MockInvoker>, dir: &TempDir) -> Engine {
        let config = EngineConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            strict: false,
            ..Default::default()
        };
        Engine::new(invoker, config)
    }

    #[test]
    fn test_settings_digest_tracks_prompt_and_fields() {
        let base = PhaseSpec::new("p", "Summarize {{path}}");
        assert_eq!(base.settings_digest(), PhaseSpec::new("q", "Summarize {{path}}").settings_digest());
        assert_ne!(base.settings_digest(), PhaseSpec::new("p", "Review {{path}}").settings_digest());
        assert_ne!(
            base.settings_digest(),
            base.clone().with_output_fields(&["summary"]).settings_digest()
        );
        assert_ne!(
            base.reduce_digest(),
            base.clone().with_reduce(ReduceStrategy::Format(ReduceFormat::Csv)).reduce_digest()
        );
    }

    #[test]
    fn test_enrich_from_upstream_skips_failures() {
        let mut items = split(&batch_of("path", &["a", "b"]));
        let ok = MapResult::text(items[0].clone(), "summary of a".to_string());
        let failed = MapResult::failure(items[1].clone(), "boom", None);
        let upstream = Upstream {
            phase: "analyze".to_string(),
            changed: BTreeSet::new(),
            results: BTreeMap::from([("a".to_string(), ok), ("b".to_string(), failed)]),
        };

        enrich_from_upstream(&mut items, &upstream);
        assert_eq!(items[0].field("analyze.output"), Some("summary of a"));
        assert_eq!(items[1].field("analyze.output"), None);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let invoker = Arc::new(MockInvoker::builder().build());
        let engine = engine(invoker.clone(), &dir);
        let ctx = RunContext::new("fp").with_cancel(Arc::new(|| true));

        let err = engine
            .run_phase(&PhaseSpec::new("p", "{{path}}"), &batch_of("path", &["a"]), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { completed: 0, .. }));
        assert_eq!(err.exit_code(), 130);
        assert_eq!(invoker.call_count(), 0);
    }

    #[tokio::test]
    async fn test_artifact_reused_when_fully_cached() {
        let dir = TempDir::new().unwrap();
        let invoker = Arc::new(MockInvoker::builder().with_default("done").build());
        let engine = engine(invoker.clone(), &dir);
        let spec = PhaseSpec::new("p", "{{path}}").with_reduce(ReduceStrategy::Format(ReduceFormat::Text));
        let batch = batch_of("path", &["a", "b"]);
        let ctx = RunContext::new("fp");

        let first = engine.run_phase(&spec, &batch, &ctx).await.unwrap();
        assert!(first.reduced);
        assert_eq!(first.state, PhaseCacheState::FullRebuild);

        let second = engine.run_phase(&spec, &batch, &ctx).await.unwrap();
        assert!(!second.reduced);
        assert_eq!(second.state, PhaseCacheState::FullyCached);
        assert_eq!(second.output.formatted_output, first.output.formatted_output);
        assert!(second.output.results.iter().all(|r| r.cached));

        let recut = spec.clone().with_reduce(ReduceStrategy::Format(ReduceFormat::Json));
        let third = engine.run_phase(&recut, &batch, &ctx).await.unwrap();
        assert!(third.reduced);
        assert_eq!(invoker.call_count(), 2);
    }
}
