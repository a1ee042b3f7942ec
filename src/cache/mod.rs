//! Incremental cache of per-item results
//!
//! Entries are written one at a time as map results arrive and are trusted
//! only under the fingerprint they carry. A manifest written at phase end
//! marks the set complete; its absence means the previous run stopped early
//! and entries are recovered individually.

pub mod detect;
pub mod manifest;
pub mod plan;
pub mod store;

pub use detect::{ChangeDetector, DigestChangeDetector, GitChangeDetector};
pub use manifest::{CacheEntry, CacheManifest, PhaseArtifact};
pub use plan::{plan_phase, CacheMode, CachePlan, PhaseCacheState, PlanRequest};
pub use store::{CacheStatus, CacheStore, PhaseCache, ScanResult};
