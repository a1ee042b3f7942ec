//! # Batchmill
//!
//! Split a batch of inputs into work items, map each through an AI transform
//! with bounded parallelism, and reduce the results into one artifact. An
//! incremental cache keyed by content fingerprints makes re-runs process only
//! what changed.
//!
//! ## Usage
//!
//! ```bash
//! batchmill run pipeline.toml --input items.json [--git src/] [--force]
//! ```
//!
//! ## Modules
//!
//! - `splitter` - Batch input to addressable work items
//! - `template` - `{{name}}` prompt templates and reserved placeholders
//! - `mapper` - Bounded parallel per-item transforms
//! - `interpreter` - Lenient extraction of structured fields from model replies
//! - `reducer` - Deterministic formatters and AI synthesis
//! - `cache` - Per-item result cache, manifests and change detection
//! - `fingerprint` - Content and git fingerprints
//! - `pipeline` - Phase orchestration over the cache
//! - `invoker` - Transform backend abstraction and the subprocess backend
//! - `config` - Engine and pipeline configuration
//! - `testing` - Mocks and builders for tests
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod interpreter;
pub mod invoker;
pub mod mapper;
pub mod pipeline;
pub mod reducer;
pub mod splitter;
pub mod template;

pub mod testing;

pub use error::{EngineError, Result};
pub use pipeline::{Engine, PhaseOutcome, PhaseSpec, RunContext};
