//! Bounded parallel mapping
//!
//! Every work item is started at once and awaited jointly; a FIFO-fair
//! semaphore keeps at most `concurrency` invocations unresolved. Each task
//! holds exactly one permit for its lifetime and the permit guard releases it
//! on every exit path.

use crate::interpreter;
use crate::invoker::{InvokeRequest, TransformInvoker};
use crate::splitter::WorkItem;
use crate::template::{self, PromptTemplate, ReservedValues};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 5;

/// Outcome of mapping one work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapResult {
    pub item: WorkItem,
    pub success: bool,
    /// Parsed fields (structured mode)
    pub structured_output: Option<Map<String, Value>>,
    /// Reply text (text mode)
    pub raw_text: Option<String>,
    pub error: Option<String>,
    /// Unmodified model reply, kept for diagnosis
    pub raw_response: Option<String>,
    /// Restored from the incremental cache rather than invoked
    #[serde(default)]
    pub cached: bool,
}

impl MapResult {
    pub fn structured(item: WorkItem, output: Map<String, Value>, raw_response: String) -> Self {
        Self {
            item,
            success: true,
            structured_output: Some(output),
            raw_text: None,
            error: None,
            raw_response: Some(raw_response),
            cached: false,
        }
    }

    pub fn text(item: WorkItem, text: String) -> Self {
        Self {
            item,
            success: true,
            structured_output: None,
            raw_text: Some(text),
            error: None,
            raw_response: None,
            cached: false,
        }
    }

    pub fn failure(item: WorkItem, error: impl Into<String>, raw_response: Option<String>) -> Self {
        Self {
            item,
            success: false,
            structured_output: None,
            raw_text: None,
            error: Some(error.into()),
            raw_response,
            cached: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.item.id
    }

    /// The output as one JSON value: the field object, or the text
    pub fn output_value(&self) -> Value {
        match (&self.structured_output, &self.raw_text) {
            (Some(fields), _) => Value::Object(fields.clone()),
            (None, Some(text)) => Value::String(text.clone()),
            (None, None) => Value::Null,
        }
    }

    /// Output as named columns; text mode yields a single `output` column
    pub fn output_fields(&self) -> Vec<(String, Value)> {
        match (&self.structured_output, &self.raw_text) {
            (Some(fields), _) => fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            (None, Some(text)) => vec![("output".to_string(), Value::String(text.clone()))],
            (None, None) => Vec::new(),
        }
    }
}

/// Which stage a progress event reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Mapping,
    Reducing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    pub completed_items: usize,
    pub total_items: usize,
    pub failed_items: usize,
}

pub type CompletionCallback = Arc<dyn Fn(&WorkItem, &MapResult) -> anyhow::Result<()> + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;
pub type CancelPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Observers and controls for one mapping run
#[derive(Clone, Default)]
pub struct MapHooks {
    pub on_complete: Option<CompletionCallback>,
    pub on_progress: Option<ProgressCallback>,
    pub is_cancelled: Option<CancelPredicate>,
}

impl MapHooks {
    fn cancelled(&self) -> bool {
        self.is_cancelled.as_ref().is_some_and(|check| check())
    }

    fn progress(&self, event: ProgressEvent) {
        if let Some(callback) = &self.on_progress {
            callback(&event);
        }
    }

    fn complete(&self, item: &WorkItem, result: &MapResult) {
        if let Some(callback) = &self.on_complete {
            if let Err(e) = callback(item, result) {
                warn!(item_id = %item.id, "Completion callback failed: {:#}", e);
            }
        }
    }
}

/// Mapper settings
#[derive(Debug, Clone)]
pub struct MapperConfig {
    pub concurrency: usize,
    /// Unknown template fields fail the item instead of rendering empty
    pub strict_templates: bool,
    pub timeout: Option<Duration>,
    /// Per-item model name template
    pub model: Option<PromptTemplate>,
    /// Declared output fields; `None` selects text mode
    pub output_fields: Option<Vec<String>>,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            strict_templates: false,
            timeout: None,
            model: None,
            output_fields: None,
        }
    }
}

/// Results of a mapping run
#[derive(Debug, Clone, Default)]
pub struct MapRun {
    /// Results ordered by item ordinal
    pub results: Vec<MapResult>,
    /// Items never dispatched because cancellation was requested
    pub skipped: Vec<WorkItem>,
}

impl MapRun {
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    pub fn was_cancelled(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Applies a prompt template to work items through an invoker
pub struct Mapper {
    invoker: Arc<dyn TransformInvoker>,
    template: PromptTemplate,
    config: MapperConfig,
}

impl Mapper {
    pub fn new(invoker: Arc<dyn TransformInvoker>, template: PromptTemplate, config: MapperConfig) -> Self {
        Self {
            invoker,
            template,
            config,
        }
    }

    /// Map every item with bounded parallelism
    pub async fn map_all(&self, items: Vec<WorkItem>, hooks: &MapHooks) -> MapRun {
        let total = items.len();
        if total == 0 {
            return MapRun::default();
        }

        let concurrency = self.config.concurrency.max(1);
        info!(
            "Mapping {} work items (concurrency: {})",
            total, concurrency
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let completed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        let tasks = items.into_iter().map(|item| {
            let semaphore = semaphore.clone();
            let completed = &completed;
            let failed = &failed;
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(item),
                };

                if hooks.cancelled() {
                    debug!(item_id = %item.id, "Cancellation requested, not dispatching");
                    return Err(item);
                }

                let result = self.map_item(&item).await;
                hooks.complete(&item, &result);

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                let failures = if result.success {
                    failed.load(Ordering::SeqCst)
                } else {
                    failed.fetch_add(1, Ordering::SeqCst) + 1
                };
                hooks.progress(ProgressEvent {
                    phase: ProgressPhase::Mapping,
                    completed_items: done,
                    total_items: total,
                    failed_items: failures,
                });

                Ok(result)
            }
        });

        let mut run = MapRun::default();
        for outcome in join_all(tasks).await {
            match outcome {
                Ok(result) => run.results.push(result),
                Err(item) => run.skipped.push(item),
            }
        }
        run.results.sort_by_key(|r| r.item.ordinal);
        run.skipped.sort_by_key(|i| i.ordinal);

        info!(
            "Mapping finished: {} succeeded, {} failed, {} skipped",
            run.results.len() - run.failed(),
            run.failed(),
            run.skipped.len()
        );
        run
    }

    /// Render, invoke and interpret a single item
    pub async fn map_item(&self, item: &WorkItem) -> MapResult {
        let reserved = self.reserved_values(item);

        let prompt = match self
            .template
            .render(item, &reserved, self.config.strict_templates)
        {
            Ok(prompt) => prompt,
            Err(e) => return MapResult::failure(item.clone(), e.to_string(), None),
        };

        let model = self
            .config
            .model
            .as_ref()
            .and_then(|model| model.render(item, &reserved, false).ok())
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty());

        debug!(item_id = %item.id, ordinal = item.ordinal, "Invoking transform");
        let request = InvokeRequest::new(prompt)
            .with_model(model)
            .with_timeout(self.config.timeout);

        let response = match self.invoker.invoke(request).await {
            Ok(response) => response,
            Err(e) => return MapResult::failure(item.clone(), format!("{:#}", e), None),
        };

        if !response.success {
            let error = response
                .error
                .unwrap_or_else(|| "transform reported failure without a diagnostic".to_string());
            return MapResult::failure(item.clone(), error, response.response);
        }

        let text = response.response.unwrap_or_default();
        if text.trim().is_empty() {
            return MapResult::failure(item.clone(), "transform returned an empty response", Some(text));
        }

        match &self.config.output_fields {
            Some(fields) if !fields.is_empty() => match interpreter::interpret(&text, fields) {
                Ok(output) => MapResult::structured(item.clone(), output, text),
                Err(e) => MapResult::failure(item.clone(), e.to_string(), Some(text)),
            },
            _ => MapResult::text(item.clone(), text),
        }
    }

    fn reserved_values(&self, item: &WorkItem) -> ReservedValues {
        let mut reserved = ReservedValues::new();
        reserved.insert(
            template::ITEMS,
            serde_json::to_string(&item.payload).unwrap_or_default(),
        );
        reserved.insert(template::COUNT, item.total_count.to_string());
        reserved
    }
}
