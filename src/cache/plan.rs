//! Deciding what a phase must (re)process

use super::detect::ChangeDetector;
use super::manifest::CacheEntry;
use super::store::PhaseCache;
use crate::splitter::WorkItem;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

/// Caller's stance towards existing cache entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    #[default]
    Normal,
    /// Discard everything for the phase and rebuild
    ForceInvalidate,
    /// Accept entries regardless of their fingerprint
    UseAny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseCacheState {
    FullRebuild,
    PartialRebuild,
    FullyCached,
}

impl fmt::Display for PhaseCacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FullRebuild => "full rebuild",
            Self::PartialRebuild => "partial rebuild",
            Self::FullyCached => "fully cached",
        };
        f.write_str(name)
    }
}

/// Inputs for planning one phase run
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub items: &'a [WorkItem],
    pub fingerprint: &'a str,
    pub mode: CacheMode,
    /// Ids whose upstream result changed in this run
    pub upstream_changed: &'a BTreeSet<String>,
    /// Digest of the phase settings; a mismatch invalidates every entry
    pub settings_digest: &'a str,
}

#[derive(Debug, Clone)]
pub struct CachePlan {
    pub state: PhaseCacheState,
    /// Trusted entries by id
    pub cached: BTreeMap<String, CacheEntry>,
    /// Ids to process, in item order
    pub missing: Vec<String>,
    /// Ids whose entries were re-stamped with the current fingerprint
    pub restamped: Vec<String>,
}

impl CachePlan {
    fn rebuild_all(items: &[WorkItem]) -> Self {
        Self {
            state: PhaseCacheState::FullRebuild,
            cached: BTreeMap::new(),
            missing: items.iter().map(|i| i.id.clone()).collect(),
            restamped: Vec::new(),
        }
    }
}

fn state_for(cached: usize, missing: usize) -> PhaseCacheState {
    match (cached, missing) {
        (_, 0) => PhaseCacheState::FullyCached,
        (0, _) => PhaseCacheState::FullRebuild,
        _ => PhaseCacheState::PartialRebuild,
    }
}

/// Plan a phase run against its cache.
///
/// Normal mode trusts the manifest: ids it covers that the detector and the
/// upstream phase consider unchanged are re-stamped and loaded; any expected
/// entry that turns out absent is processed again. Changed ids are still
/// recovered when an earlier, unfinished run saved them under the current
/// fingerprint from the same payload and settings. Without a manifest (a run
/// that never completed) that recovery applies to every item.
pub fn plan_phase(cache: &PhaseCache, detector: &dyn ChangeDetector, request: &PlanRequest<'_>) -> CachePlan {
    let phase = cache.phase();
    let ids: Vec<String> = request.items.iter().map(|i| i.id.clone()).collect();

    match request.mode {
        CacheMode::ForceInvalidate => {
            if let Err(e) = cache.clear() {
                warn!(phase = %phase, "Failed to clear cache before forced rebuild: {}", e);
            }
            info!(phase = %phase, "Cache invalidated, rebuilding all {} items", ids.len());
            CachePlan::rebuild_all(request.items)
        }
        CacheMode::UseAny => {
            let scan = cache.scan(&ids, None);
            let state = if scan.missing.is_empty() {
                PhaseCacheState::FullyCached
            } else {
                PhaseCacheState::PartialRebuild
            };
            info!(
                phase = %phase,
                cached = scan.found.len(),
                missing = scan.missing.len(),
                "Using any cached entries regardless of fingerprint"
            );
            CachePlan {
                state,
                cached: scan.found,
                missing: scan.missing,
                restamped: Vec::new(),
            }
        }
        CacheMode::Normal => match cache.read_manifest() {
            Some(manifest) => {
                let mut changed: BTreeSet<String> =
                    match detector.changed_ids(&manifest, request.fingerprint, request.items) {
                        Ok(changed) => changed,
                        Err(e) => {
                            warn!(phase = %phase, "Change detection failed, treating all items as changed: {}", e);
                            ids.iter().cloned().collect()
                        }
                    };

                if manifest.settings_digest.as_deref() != Some(request.settings_digest) {
                    debug!(phase = %phase, "Phase settings changed since the manifest was written");
                    changed.extend(ids.iter().cloned());
                }
                changed.extend(
                    ids.iter()
                        .filter(|id| request.upstream_changed.contains(*id) || !manifest.covers(id))
                        .cloned(),
                );

                let current: BTreeSet<String> = ids.iter().cloned().collect();
                let removed = manifest.removed_ids(&current);
                if !removed.is_empty() {
                    debug!(phase = %phase, "{} items left the batch since the last run", removed.len());
                }

                let unaffected: Vec<String> = ids.iter().filter(|id| !changed.contains(*id)).cloned().collect();
                let restamped = cache.restamp(&unaffected, &manifest.fingerprint, request.fingerprint);
                let scan = cache.scan(&unaffected, Some(request.fingerprint));

                for id in &scan.missing {
                    warn!(
                        phase = %phase,
                        item_id = %id,
                        "Manifest lists an entry that is not on disk, processing it again"
                    );
                }

                // A run that stopped early may already hold changed items
                let recoverable: Vec<WorkItem> = request
                    .items
                    .iter()
                    .filter(|item| changed.contains(&item.id) && !request.upstream_changed.contains(&item.id))
                    .cloned()
                    .collect();
                let recovered = cache.scan_matching(&recoverable, request.fingerprint, request.settings_digest);
                if !recovered.found.is_empty() {
                    info!(
                        phase = %phase,
                        recovered = recovered.found.len(),
                        "Recovered changed items already saved under the current fingerprint"
                    );
                }

                let mut cached = scan.found;
                cached.extend(recovered.found);
                let missing: Vec<String> = ids.iter().filter(|id| !cached.contains_key(*id)).cloned().collect();

                let state = if missing.is_empty() {
                    PhaseCacheState::FullyCached
                } else {
                    PhaseCacheState::PartialRebuild
                };
                info!(
                    phase = %phase,
                    state = %state,
                    cached = cached.len(),
                    missing = missing.len(),
                    restamped = restamped.len(),
                    "Planned phase from manifest"
                );

                CachePlan {
                    state,
                    cached,
                    missing,
                    restamped,
                }
            }
            None => {
                let candidates: Vec<WorkItem> = request
                    .items
                    .iter()
                    .filter(|item| !request.upstream_changed.contains(&item.id))
                    .cloned()
                    .collect();
                let mut scan = cache.scan_matching(&candidates, request.fingerprint, request.settings_digest);

                let missing: Vec<String> = ids.iter().filter(|id| !scan.found.contains_key(*id)).cloned().collect();
                scan.missing = missing;

                let state = state_for(scan.found.len(), scan.missing.len());
                info!(
                    phase = %phase,
                    state = %state,
                    recovered = scan.found.len(),
                    missing = scan.missing.len(),
                    "No manifest, recovered entries for the current fingerprint"
                );

                CachePlan {
                    state,
                    cached: scan.found,
                    missing: scan.missing,
                    restamped: Vec::new(),
                }
            }
        },
    }
}
