//! Integration tests for phase orchestration over the incremental cache

use batchmill::cache::{CacheMode, PhaseCacheState};
use batchmill::config::EngineConfig;
use batchmill::reducer::{ReduceFormat, ReduceStrategy, SynthesisConfig};
use batchmill::splitter::{BatchInput, Payload};
use batchmill::testing::{batch_of, mocks::MockInvoker};
use batchmill::{Engine, EngineError, PhaseSpec, RunContext};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn engine(invoker: &Arc<MockInvoker>, dir: &TempDir, strict: bool) -> Engine {
    let config = EngineConfig {
        cache_dir: Some(dir.path().to_path_buf()),
        strict,
        ..Default::default()
    };
    Engine::new(invoker.clone(), config)
}

fn files(rows: &[(&str, &str)]) -> BatchInput {
    let rows = rows
        .iter()
        .map(|(path, body)| {
            Payload::from([
                ("path".to_string(), path.to_string()),
                ("body".to_string(), body.to_string()),
            ])
        })
        .collect();
    BatchInput::new(rows).with_id_field("path")
}

#[tokio::test]
async fn test_unchanged_rerun_invokes_nothing() {
    let dir = TempDir::new().unwrap();
    let invoker = Arc::new(
        MockInvoker::builder()
            .with_default("{\"summary\": \"looks fine\", \"risk\": 2}")
            .build(),
    );
    let engine = engine(&invoker, &dir, true);
    let spec = PhaseSpec::new("analyze", "Analyze {{path}}")
        .with_output_fields(&["summary", "risk"])
        .with_reduce(ReduceStrategy::Format(ReduceFormat::Json));
    let batch = batch_of("path", &["a.rs", "b.rs", "c.rs"]);
    let ctx = RunContext::new("abc123");

    let fresh = engine.run_phase(&spec, &batch, &ctx).await.unwrap();
    assert_eq!(fresh.state, PhaseCacheState::FullRebuild);
    assert_eq!(invoker.call_count(), 3);

    let cached = engine.run_phase(&spec, &batch, &ctx).await.unwrap();
    assert_eq!(cached.state, PhaseCacheState::FullyCached);
    assert_eq!(invoker.call_count(), 3);
    assert_eq!(cached.invocations(), 0);
    assert_eq!(cached.output.formatted_output, fresh.output.formatted_output);

    for (old, new) in fresh.output.results.iter().zip(&cached.output.results) {
        assert_eq!(old.structured_output, new.structured_output);
        assert!(new.cached);
    }
}

#[tokio::test]
async fn test_item_failure_counts_without_strict_mode() {
    let dir = TempDir::new().unwrap();
    let invoker = Arc::new(
        MockInvoker::builder()
            .with_error("item-2", "model overloaded")
            .with_default("done")
            .build(),
    );
    let engine = engine(&invoker, &dir, false);
    let spec = PhaseSpec::new("label", "Label {{name}}");
    let batch = batch_of("name", &["item-1", "item-2", "item-3"]);

    let outcome = engine.run_phase(&spec, &batch, &RunContext::new("fp")).await.unwrap();
    assert_eq!(outcome.output.results.len(), 3);
    assert_eq!(outcome.output.summary.failed, 1);
    assert_eq!(outcome.output.summary.succeeded, 2);
    assert_eq!(outcome.failed_ids, vec!["item-2"]);
    assert!(outcome
        .output
        .formatted_output
        .ends_with("Total: 3 | Succeeded: 2 | Failed: 1"));

    // Failures are not recorded as complete, so only the failed item is retried
    let retry = engine.run_phase(&spec, &batch, &RunContext::new("fp")).await.unwrap();
    assert_eq!(retry.fresh_ids, vec!["item-2"]);
    assert_eq!(invoker.call_count(), 4);
}

#[tokio::test]
async fn test_strict_mode_fails_phase_after_persisting() {
    let dir = TempDir::new().unwrap();
    let invoker = Arc::new(
        MockInvoker::builder()
            .with_exception("b.rs", "connection reset")
            .with_default("ok")
            .build(),
    );
    let engine = engine(&invoker, &dir, true);
    let spec = PhaseSpec::new("review", "Review {{path}}");
    let batch = batch_of("path", &["a.rs", "b.rs"]);

    let err = engine
        .run_phase(&spec, &batch, &RunContext::new("fp"))
        .await
        .unwrap_err();
    match &err {
        EngineError::StrictMode { phase, failed_ids } => {
            assert_eq!(phase, "review");
            assert_eq!(failed_ids, &vec!["b.rs".to_string()]);
        }
        other => panic!("expected strict mode error, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 4);

    let status = engine.store().phase("review").status();
    assert_eq!(status.entries, 1);
    assert_eq!(status.manifest.unwrap().item_ids, vec!["a.rs"]);
}

#[tokio::test]
async fn test_two_phase_change_propagates_downstream() {
    let dir = TempDir::new().unwrap();
    let invoker = Arc::new(
        MockInvoker::builder()
            .with_success("Analyze", "{\"summary\": \"fine\"}")
            .with_success("Report", "reported")
            .build(),
    );
    let engine = engine(&invoker, &dir, true);
    let phases = vec![
        PhaseSpec::new("analyze", "Analyze {{path}} {{body}}").with_output_fields(&["summary"]),
        PhaseSpec::new("report", "Report on {{path}}: {{analyze.summary}}")
            .with_depends_on("analyze")
            .with_reduce(ReduceStrategy::Format(ReduceFormat::Csv)),
    ];

    let first = engine
        .run_pipeline(&phases, &files(&[("x.rs", "1"), ("y.rs", "1")]), &RunContext::new("v1"))
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(invoker.call_count(), 4);
    assert!(invoker
        .prompts()
        .iter()
        .any(|p| p == "Report on x.rs: fine"));

    let second = engine
        .run_pipeline(&phases, &files(&[("x.rs", "2"), ("y.rs", "1")]), &RunContext::new("v2"))
        .await
        .unwrap();
    assert_eq!(invoker.call_count(), 6);

    let (analyze, report) = (&second[0], &second[1]);
    assert_eq!(analyze.state, PhaseCacheState::PartialRebuild);
    assert_eq!(analyze.fresh_ids, vec!["x.rs"]);
    assert_eq!(analyze.restamped, vec!["y.rs"]);

    assert_eq!(report.fresh_ids, vec!["x.rs"]);
    assert_eq!(report.restamped, vec!["y.rs"]);
    assert!(report.reduced);
    assert!(report.output.formatted_output.starts_with("analyze.summary,body,path,output,success"));

    let entry = engine.store().phase("report").load_entry("y.rs").unwrap();
    assert_eq!(entry.fingerprint, "v2");
}

#[tokio::test]
async fn test_use_any_and_force_modes() {
    let dir = TempDir::new().unwrap();
    let invoker = Arc::new(MockInvoker::builder().with_default("ok").build());
    let engine = engine(&invoker, &dir, true);
    let spec = PhaseSpec::new("p", "{{path}}");
    let batch = batch_of("path", &["a", "b"]);

    engine.run_phase(&spec, &batch, &RunContext::new("one")).await.unwrap();
    assert_eq!(invoker.call_count(), 2);

    let any = RunContext::new("two").with_mode(CacheMode::UseAny);
    let outcome = engine.run_phase(&spec, &batch, &any).await.unwrap();
    assert_eq!(outcome.state, PhaseCacheState::FullyCached);
    assert_eq!(invoker.call_count(), 2);

    let force = RunContext::new("one").with_mode(CacheMode::ForceInvalidate);
    let outcome = engine.run_phase(&spec, &batch, &force).await.unwrap();
    assert_eq!(outcome.state, PhaseCacheState::FullRebuild);
    assert!(outcome.reduced);
    assert_eq!(invoker.call_count(), 4);
}

#[tokio::test]
async fn test_interrupted_run_recovers_saved_items() {
    let dir = TempDir::new().unwrap();
    let invoker = Arc::new(MockInvoker::builder().with_default("ok").build());
    let config = EngineConfig {
        cache_dir: Some(dir.path().to_path_buf()),
        concurrency: 1,
        ..Default::default()
    };
    let engine = Engine::new(invoker.clone(), config);
    let spec = PhaseSpec::new("p", "{{path}}");
    let batch = batch_of("path", &["a", "b", "c", "d"]);

    let calls = invoker.clone();
    let interrupted = RunContext::new("fp").with_cancel(Arc::new(move || calls.call_count() >= 2));
    let err = engine.run_phase(&spec, &batch, &interrupted).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled { completed: 2, .. }));
    assert!(engine.store().phase("p").read_manifest().is_none());

    let resumed = engine.run_phase(&spec, &batch, &RunContext::new("fp")).await.unwrap();
    assert_eq!(resumed.state, PhaseCacheState::PartialRebuild);
    assert_eq!(resumed.fresh_ids, vec!["c", "d"]);
    assert_eq!(invoker.call_count(), 4);
    assert!(engine.store().phase("p").read_manifest().is_some());
}

#[tokio::test]
async fn test_removed_item_leaves_the_reduced_output() {
    let dir = TempDir::new().unwrap();
    let invoker = Arc::new(MockInvoker::builder().with_default("ok").build());
    let engine = engine(&invoker, &dir, true);
    let spec = PhaseSpec::new("p", "{{path}}").with_reduce(ReduceStrategy::Format(ReduceFormat::Text));

    let full = engine
        .run_phase(&spec, &batch_of("path", &["a", "b", "c"]), &RunContext::new("fp"))
        .await
        .unwrap();
    assert!(full.output.formatted_output.contains("=== c ==="));

    let shrunk = engine
        .run_phase(&spec, &batch_of("path", &["a", "b"]), &RunContext::new("fp"))
        .await
        .unwrap();
    assert_eq!(shrunk.state, PhaseCacheState::FullyCached);
    assert_eq!(shrunk.invocations(), 0);
    assert!(shrunk.reduced);
    assert_eq!(shrunk.output.summary.total, 2);
    assert!(!shrunk.output.formatted_output.contains("=== c ==="));
    assert_eq!(invoker.call_count(), 3);

    let again = engine
        .run_phase(&spec, &batch_of("path", &["a", "b"]), &RunContext::new("fp"))
        .await
        .unwrap();
    assert!(!again.reduced);
    assert_eq!(again.output.formatted_output, shrunk.output.formatted_output);
}

#[tokio::test]
async fn test_interrupted_run_after_completed_run_keeps_saved_items() {
    let dir = TempDir::new().unwrap();
    let invoker = Arc::new(MockInvoker::builder().with_default("ok").build());
    let config = EngineConfig {
        cache_dir: Some(dir.path().to_path_buf()),
        concurrency: 1,
        ..Default::default()
    };
    let engine = Engine::new(invoker.clone(), config);
    let spec = PhaseSpec::new("p", "Review {{path}} {{body}}").with_reduce(ReduceStrategy::Format(ReduceFormat::Text));

    let v1 = files(&[("x", "1"), ("y", "1"), ("z", "1")]);
    engine.run_phase(&spec, &v1, &RunContext::new("v1")).await.unwrap();
    assert_eq!(invoker.call_count(), 3);

    let v2 = files(&[("x", "2"), ("y", "2"), ("z", "2")]);
    let calls = invoker.clone();
    let interrupted = RunContext::new("v2").with_cancel(Arc::new(move || calls.call_count() >= 4));
    let err = engine.run_phase(&spec, &v2, &interrupted).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled { completed: 1, .. }));

    let resumed = engine.run_phase(&spec, &v2, &RunContext::new("v2")).await.unwrap();
    assert_eq!(resumed.state, PhaseCacheState::PartialRebuild);
    assert_eq!(resumed.fresh_ids, vec!["y", "z"]);
    assert_eq!(invoker.call_count(), 6);
    assert!(resumed.reduced);

    let manifest = engine.store().phase("p").read_manifest().unwrap();
    assert_eq!(manifest.fingerprint, "v2");
    assert_eq!(manifest.item_ids, vec!["x", "y", "z"]);
}

#[tokio::test]
async fn test_prompt_change_after_interruption_discards_saved_items() {
    let dir = TempDir::new().unwrap();
    let invoker = Arc::new(
        MockInvoker::builder()
            .with_success("Old", "old-answer")
            .with_success("New", "new-answer")
            .build(),
    );
    let config = EngineConfig {
        cache_dir: Some(dir.path().to_path_buf()),
        concurrency: 1,
        ..Default::default()
    };
    let engine = Engine::new(invoker.clone(), config);
    let batch = batch_of("path", &["a", "b"]);

    let calls = invoker.clone();
    let interrupted = RunContext::new("fp").with_cancel(Arc::new(move || calls.call_count() >= 1));
    let err = engine
        .run_phase(&PhaseSpec::new("p", "Old {{path}}"), &batch, &interrupted)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled { completed: 1, .. }));

    let rerun = engine
        .run_phase(&PhaseSpec::new("p", "New {{path}}"), &batch, &RunContext::new("fp"))
        .await
        .unwrap();
    assert_eq!(rerun.state, PhaseCacheState::FullRebuild);
    assert_eq!(rerun.fresh_ids, vec!["a", "b"]);
    assert!(rerun
        .output
        .results
        .iter()
        .all(|r| r.raw_text.as_deref() == Some("new-answer")));
}

#[tokio::test]
async fn test_engine_respects_concurrency_limit() {
    let dir = TempDir::new().unwrap();
    let invoker = Arc::new(
        MockInvoker::builder()
            .with_delay(Duration::from_millis(15))
            .build(),
    );
    let config = EngineConfig {
        cache_dir: Some(dir.path().to_path_buf()),
        concurrency: 2,
        ..Default::default()
    };
    let engine = Engine::new(invoker.clone(), config);
    let batch = batch_of("path", &["a", "b", "c", "d", "e", "f", "g"]);

    engine
        .run_phase(&PhaseSpec::new("p", "{{path}}"), &batch, &RunContext::new("fp"))
        .await
        .unwrap();
    assert_eq!(invoker.call_count(), 7);
    assert!(invoker.max_concurrent() <= 2);
}

#[tokio::test]
async fn test_synthesis_failure_keeps_items_cached() {
    let dir = TempDir::new().unwrap();
    let failing = Arc::new(
        MockInvoker::builder()
            .with_error("Summarize all", "context window exceeded")
            .with_default("item ok")
            .build(),
    );
    let spec = PhaseSpec::new("digest", "Describe {{path}}").with_reduce(ReduceStrategy::Synthesize(
        SynthesisConfig::new("Summarize all {{COUNT}}: {{RESULTS}}"),
    ));
    let batch = batch_of("path", &["a", "b"]);

    let err = engine(&failing, &dir, true)
        .run_phase(&spec, &batch, &RunContext::new("fp"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Synthesis { .. }));
    assert_eq!(err.exit_code(), 3);

    let working = Arc::new(
        MockInvoker::builder()
            .with_success("Summarize all", "overall fine")
            .with_default("item ok")
            .build(),
    );
    let outcome = engine(&working, &dir, true)
        .run_phase(&spec, &batch, &RunContext::new("fp"))
        .await
        .unwrap();
    assert_eq!(outcome.invocations(), 0);
    assert_eq!(outcome.output.formatted_output, "overall fine");
    assert_eq!(working.call_count(), 1);
    assert!(working.prompts()[0].starts_with("Summarize all 2: ["));
}
