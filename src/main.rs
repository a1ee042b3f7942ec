use batchmill::cache::{CacheMode, CacheStore, GitChangeDetector};
use batchmill::config::{EngineConfig, PipelineConfig};
use batchmill::fingerprint::{content_fingerprint, git_fingerprint, locate_in_repo};
use batchmill::invoker::CommandInvoker;
use batchmill::mapper::{ProgressEvent, ProgressPhase};
use batchmill::reducer::{ReduceFormat, ReduceStrategy};
use batchmill::splitter::BatchInput;
use batchmill::{Engine, EngineError, PhaseOutcome, PhaseSpec, Result, RunContext};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Split, map and reduce AI batch transformations with an incremental cache
#[derive(Parser)]
#[command(name = "batchmill")]
#[command(about = "Run AI batch pipelines that only reprocess what changed", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every phase of a pipeline over a batch
    Run {
        /// Pipeline definition (TOML)
        pipeline: PathBuf,

        /// JSON array of input rows
        #[arg(short, long)]
        input: PathBuf,

        /// Discard cached results and rebuild everything
        #[arg(long, conflicts_with = "use_any_cache")]
        force: bool,

        /// Accept cached results regardless of fingerprint
        #[arg(long)]
        use_any_cache: bool,

        /// Explicit fingerprint for this run
        #[arg(long, conflicts_with = "git")]
        fingerprint: Option<String>,

        /// Fingerprint from the git tree at this path; changed files select items
        #[arg(long)]
        git: Option<PathBuf>,

        /// Item field naming the file each item covers (with --git)
        #[arg(long, default_value = "path")]
        path_field: String,

        /// Report item failures without failing the run
        #[arg(long)]
        no_strict: bool,

        /// Override the engine concurrency
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Cache root directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Write each phase output to a file here instead of stdout
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Inspect or clear phase caches
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Remove all cached results of a phase
    Clear {
        phase: String,
        /// Pipeline whose engine settings locate the cache
        #[arg(short, long)]
        pipeline: Option<PathBuf>,
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Show what is cached for a phase
    Status {
        phase: String,
        #[arg(short, long)]
        pipeline: Option<PathBuf>,
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn,batchmill=info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .init();

    debug!("batchmill started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match cli.command {
        Commands::Run {
            pipeline,
            input,
            force,
            use_any_cache,
            fingerprint,
            git,
            path_field,
            no_strict,
            concurrency,
            cache_dir,
            output_dir,
        } => {
            let options = RunOptions {
                pipeline,
                input,
                mode: if force {
                    CacheMode::ForceInvalidate
                } else if use_any_cache {
                    CacheMode::UseAny
                } else {
                    CacheMode::Normal
                },
                fingerprint,
                git,
                path_field,
                no_strict,
                concurrency,
                cache_dir,
                output_dir,
            };
            run_pipeline(options).await
        }
        Commands::Cache { command } => run_cache_command(command),
    };

    if let Err(e) = result {
        error!("Fatal error: {}", e);
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}

struct RunOptions {
    pipeline: PathBuf,
    input: PathBuf,
    mode: CacheMode,
    fingerprint: Option<String>,
    git: Option<PathBuf>,
    path_field: String,
    no_strict: bool,
    concurrency: Option<usize>,
    cache_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
}

async fn run_pipeline(options: RunOptions) -> Result<()> {
    let pipeline = PipelineConfig::load(&options.pipeline)?;
    let mut engine_config = pipeline.engine.clone();
    engine_config.merge_env_vars();
    if let Some(concurrency) = options.concurrency {
        engine_config.concurrency = concurrency;
    }
    if let Some(cache_dir) = options.cache_dir {
        engine_config.cache_dir = Some(cache_dir);
    }
    if options.no_strict {
        engine_config.strict = false;
    }
    engine_config.validate()?;

    let invoker_config = pipeline
        .invoker
        .clone()
        .ok_or_else(|| EngineError::config("pipeline has no [invoker] section"))?;

    let raw_input = std::fs::read(&options.input)?;
    let input = BatchInput::from_json(&serde_json::from_slice(&raw_input)?);
    info!("Loaded {} input rows from {}", input.len(), options.input.display());

    let mut engine = Engine::new(Arc::new(CommandInvoker::new(invoker_config)), engine_config);

    let fingerprint = match (&options.fingerprint, &options.git) {
        (Some(fingerprint), _) => fingerprint.clone(),
        (None, Some(path)) => {
            let (root, subtree) = locate_in_repo(path)?;
            let fingerprint = git_fingerprint(&root, subtree.as_deref())?;
            engine = engine.with_change_detector(Arc::new(
                GitChangeDetector::new(root)
                    .with_subtree(subtree)
                    .with_path_field(options.path_field.clone()),
            ));
            fingerprint
        }
        (None, None) => content_fingerprint([raw_input.as_slice()]),
    };
    debug!(fingerprint = %fingerprint, "Run fingerprint");

    let specs = pipeline
        .phases
        .iter()
        .map(PhaseSpec::from_config)
        .collect::<Result<Vec<_>>>()?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received, finishing in-flight items");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let progress = progress_bar();
    let bar = progress.clone();
    let ctx = RunContext::new(fingerprint)
        .with_mode(options.mode)
        .with_progress(Arc::new(move |event: &ProgressEvent| update_progress(&bar, event)))
        .with_cancel(Arc::new(move || interrupted.load(Ordering::SeqCst)));

    let outcomes = engine.run_pipeline(&specs, &input, &ctx).await;
    progress.finish_and_clear();
    let outcomes = outcomes?;

    for outcome in &outcomes {
        report(outcome);
    }
    write_outputs(&outcomes, &specs, options.output_dir.as_deref())
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        bar.set_style(style.progress_chars("█▓▒░ "));
    }
    bar
}

fn update_progress(bar: &ProgressBar, event: &ProgressEvent) {
    match event.phase {
        ProgressPhase::Mapping => {
            bar.set_length(event.total_items as u64);
            bar.set_position(event.completed_items as u64);
            if event.failed_items > 0 {
                bar.set_message(format!("{} failed", event.failed_items));
            }
        }
        ProgressPhase::Reducing => bar.set_message("reducing"),
    }
}

fn report(outcome: &PhaseOutcome) {
    let summary = &outcome.output.summary;
    eprintln!(
        "{}: {} items, {} succeeded, {} failed ({}, {} invoked, {} re-stamped)",
        outcome.phase,
        summary.total,
        summary.succeeded,
        summary.failed,
        outcome.state,
        outcome.invocations(),
        outcome.restamped.len()
    );
    for id in &outcome.failed_ids {
        if let Some(result) = outcome.output.results.iter().find(|r| r.id() == id) {
            eprintln!("  {}: {}", id, result.error.as_deref().unwrap_or("unknown error"));
        }
    }
}

fn output_extension(spec: &PhaseSpec, outcome: &PhaseOutcome) -> &'static str {
    match &spec.reduce {
        ReduceStrategy::Format(ReduceFormat::Json) => "json",
        ReduceStrategy::Format(ReduceFormat::Csv) => "csv",
        ReduceStrategy::Format(ReduceFormat::Table) => "md",
        ReduceStrategy::Format(_) => "txt",
        ReduceStrategy::Synthesize(_) if outcome.output.structured_output.is_some() => "json",
        ReduceStrategy::Synthesize(_) => "md",
    }
}

fn write_outputs(outcomes: &[PhaseOutcome], specs: &[PhaseSpec], output_dir: Option<&Path>) -> Result<()> {
    match output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            for (outcome, spec) in outcomes.iter().zip(specs) {
                let path = dir.join(format!("{}.{}", outcome.phase, output_extension(spec, outcome)));
                let body = match &outcome.output.structured_output {
                    Some(structured) => serde_json::to_string_pretty(structured)?,
                    None => outcome.output.formatted_output.clone(),
                };
                std::fs::write(&path, body)?;
                eprintln!("Wrote {}", path.display());
            }
        }
        None => {
            let headed = outcomes.len() > 1;
            for outcome in outcomes {
                if headed {
                    println!("# {}", outcome.phase);
                }
                println!("{}", outcome.output.formatted_output.trim_end());
            }
        }
    }
    Ok(())
}

fn resolve_cache_dir(pipeline: Option<&Path>, cache_dir: Option<PathBuf>) -> Result<PathBuf> {
    let mut config = match pipeline {
        Some(path) => PipelineConfig::load(path)?.engine,
        None => EngineConfig::default(),
    };
    config.merge_env_vars();
    if let Some(dir) = cache_dir {
        config.cache_dir = Some(dir);
    }
    Ok(config.cache_dir())
}

fn run_cache_command(command: CacheCommands) -> Result<()> {
    match command {
        CacheCommands::Clear {
            phase,
            pipeline,
            cache_dir,
        } => {
            let store = CacheStore::new(resolve_cache_dir(pipeline.as_deref(), cache_dir)?);
            store.phase(&phase).clear()?;
            println!("Cleared cache for phase '{}'", phase);
        }
        CacheCommands::Status {
            phase,
            pipeline,
            cache_dir,
        } => {
            let store = CacheStore::new(resolve_cache_dir(pipeline.as_deref(), cache_dir)?);
            let status = store.phase(&phase).status();
            println!("phase: {}", status.phase);
            println!("directory: {}", status.dir.display());
            println!("entries: {}", status.entries);
            match &status.manifest {
                Some(manifest) => println!(
                    "manifest: {} items complete for {} at {}",
                    manifest.item_ids.len(),
                    manifest.fingerprint,
                    manifest.completed_at.to_rfc3339()
                ),
                None => println!("manifest: none"),
            }
            println!("artifact: {}", if status.has_artifact { "yes" } else { "no" });
        }
    }
    Ok(())
}
