//! File-backed incremental cache store
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<phase>/items/<sanitized-id>.json
//! <root>/<phase>/manifest.json
//! <root>/<phase>/artifact.json
//! ```
//!
//! Every write goes to a sibling temp file and is renamed into place. Read
//! problems are logged and reported as "not cached", never as errors.

use super::manifest::{CacheEntry, CacheManifest, PhaseArtifact};
use crate::error::{EngineError, Result};
use crate::fingerprint::payload_digest;
use crate::splitter::WorkItem;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const ITEMS_DIR: &str = "items";
const MANIFEST_FILE: &str = "manifest.json";
const ARTIFACT_FILE: &str = "artifact.json";
const MAX_STEM_LEN: usize = 96;

/// Root of all phase caches
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn phase(&self, phase: &str) -> PhaseCache {
        PhaseCache {
            phase: phase.to_string(),
            dir: self.root.join(sanitize(phase)),
        }
    }
}

/// Result of looking up a set of ids
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub found: BTreeMap<String, CacheEntry>,
    /// Ids without a usable entry, in request order
    pub missing: Vec<String>,
}

/// Snapshot of a phase cache for reporting
#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub phase: String,
    pub dir: PathBuf,
    pub entries: usize,
    pub manifest: Option<CacheManifest>,
    pub has_artifact: bool,
}

/// Cache directory of a single phase
#[derive(Debug, Clone)]
pub struct PhaseCache {
    phase: String,
    dir: PathBuf,
}

/// File stem for an id; ids that needed rewriting get a digest suffix so
/// distinct ids never collide.
fn sanitize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_LEN)
        .collect();

    let cleaned = if cleaned.starts_with('.') {
        cleaned.replacen('.', "_", 1)
    } else {
        cleaned
    };

    if cleaned == id && !id.is_empty() {
        return cleaned;
    }

    let digest = Sha256::digest(id.as_bytes());
    let suffix: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", cleaned, suffix)
}

fn write_atomic(path: &Path, value: &impl Serialize) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| EngineError::cache(path, "path has no parent directory"))?;
    fs::create_dir_all(parent)
        .map_err(|e| EngineError::cache(parent, "failed to create directory").with_source(e))?;

    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| EngineError::cache(&tmp, "failed to write").with_source(e))?;
    fs::rename(&tmp, path).map_err(|e| EngineError::cache(path, "failed to rename into place").with_source(e))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), "Failed to read cache file: {}", e);
            return None;
        }
    };

    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), "Ignoring corrupt cache file: {}", e);
            None
        }
    }
}

impl PhaseCache {
    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, item_id: &str) -> PathBuf {
        self.dir.join(ITEMS_DIR).join(format!("{}.json", sanitize(item_id)))
    }

    /// Persist one result, replacing any earlier entry for the id
    pub fn save_entry(&self, item_id: &str, fingerprint: &str, payload: Value) -> Result<()> {
        self.put_entry(&CacheEntry::new(item_id, fingerprint, payload))
    }

    pub fn put_entry(&self, entry: &CacheEntry) -> Result<()> {
        write_atomic(&self.entry_path(&entry.item_id), entry)?;
        debug!(phase = %self.phase, item_id = %entry.item_id, "Saved cache entry");
        Ok(())
    }

    pub fn load_entry(&self, item_id: &str) -> Option<CacheEntry> {
        let entry: CacheEntry = read_json(&self.entry_path(item_id))?;
        if entry.item_id != item_id {
            warn!(
                phase = %self.phase,
                item_id = %item_id,
                stored = %entry.item_id,
                "Cache entry belongs to a different id"
            );
            return None;
        }
        Some(entry)
    }

    /// Look up `ids`; with a fingerprint only entries stamped with it count
    pub fn scan(&self, ids: &[String], fingerprint: Option<&str>) -> ScanResult {
        let mut result = ScanResult::default();
        for id in ids {
            match self.load_entry(id) {
                Some(entry) if fingerprint.map_or(true, |fp| entry.fingerprint == fp) => {
                    result.found.insert(id.clone(), entry);
                }
                _ => result.missing.push(id.clone()),
            }
        }
        result
    }

    /// Look up `items`, keeping only entries stamped with `fingerprint` that
    /// were computed from the item's current payload under `settings_digest`
    pub fn scan_matching(&self, items: &[WorkItem], fingerprint: &str, settings_digest: &str) -> ScanResult {
        let mut result = ScanResult::default();
        for item in items {
            let digest = payload_digest(&item.payload);
            match self.load_entry(&item.id) {
                Some(entry) if entry.fingerprint == fingerprint && entry.matches(&digest, settings_digest) => {
                    result.found.insert(item.id.clone(), entry);
                }
                Some(entry) if entry.fingerprint == fingerprint => {
                    debug!(
                        phase = %self.phase,
                        item_id = %item.id,
                        "Entry has the current fingerprint but other inputs or settings"
                    );
                    result.missing.push(item.id.clone());
                }
                _ => result.missing.push(item.id.clone()),
            }
        }
        result
    }

    /// Re-stamp entries currently stamped `from` with `to`, leaving payloads
    /// untouched. Returns the ids that were re-stamped.
    pub fn restamp(&self, ids: &[String], from: &str, to: &str) -> Vec<String> {
        let mut restamped = Vec::new();
        if from == to {
            return restamped;
        }

        for id in ids {
            let Some(mut entry) = self.load_entry(id) else {
                continue;
            };
            if entry.fingerprint != from {
                continue;
            }
            entry.fingerprint = to.to_string();
            match write_atomic(&self.entry_path(id), &entry) {
                Ok(()) => restamped.push(id.clone()),
                Err(e) => warn!(phase = %self.phase, item_id = %id, "Failed to re-stamp entry: {}", e),
            }
        }
        restamped
    }

    pub fn read_manifest(&self) -> Option<CacheManifest> {
        read_json(&self.dir.join(MANIFEST_FILE))
    }

    pub fn write_manifest(&self, manifest: &CacheManifest) -> Result<()> {
        write_atomic(&self.dir.join(MANIFEST_FILE), manifest)
    }

    pub fn load_artifact(&self) -> Option<PhaseArtifact> {
        read_json(&self.dir.join(ARTIFACT_FILE))
    }

    pub fn save_artifact(&self, artifact: &PhaseArtifact) -> Result<()> {
        write_atomic(&self.dir.join(ARTIFACT_FILE), artifact)
    }

    /// Remove every entry, the manifest and the artifact
    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                debug!(phase = %self.phase, "Cleared phase cache");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::cache(&self.dir, "failed to clear phase cache").with_source(e)),
        }
    }

    pub fn status(&self) -> CacheStatus {
        let entries = fs::read_dir(self.dir.join(ITEMS_DIR))
            .map(|dir| {
                dir.filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("json"))
                    .count()
            })
            .unwrap_or(0);

        CacheStatus {
            phase: self.phase.clone(),
            dir: self.dir.clone(),
            entries,
            manifest: self.read_manifest(),
            has_artifact: self.dir.join(ARTIFACT_FILE).exists(),
        }
    }
}
