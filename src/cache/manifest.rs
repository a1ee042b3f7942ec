//! Cache entries and the per-phase completion manifest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One persisted map result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub item_id: String,
    pub fingerprint: String,
    /// Digest of the item payload the result was computed from
    #[serde(default)]
    pub item_digest: Option<String>,
    /// Digest of the phase settings the result was computed under
    #[serde(default)]
    pub settings_digest: Option<String>,
    pub payload: Value,
    pub saved_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(item_id: impl Into<String>, fingerprint: impl Into<String>, payload: Value) -> Self {
        Self {
            item_id: item_id.into(),
            fingerprint: fingerprint.into(),
            item_digest: None,
            settings_digest: None,
            payload,
            saved_at: Utc::now(),
        }
    }

    pub fn with_digests(mut self, item_digest: impl Into<String>, settings_digest: impl Into<String>) -> Self {
        self.item_digest = Some(item_digest.into());
        self.settings_digest = Some(settings_digest.into());
        self
    }

    /// Whether the entry was produced from exactly this input and these settings
    pub fn matches(&self, item_digest: &str, settings_digest: &str) -> bool {
        self.item_digest.as_deref() == Some(item_digest) && self.settings_digest.as_deref() == Some(settings_digest)
    }
}

/// Marks a phase's entry set complete for one fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub fingerprint: String,
    /// Ids covered, in item order
    pub item_ids: Vec<String>,
    /// Payload digest per covered id
    #[serde(default)]
    pub item_digests: BTreeMap<String, String>,
    /// Digest of the phase settings (prompt, fields, model)
    #[serde(default)]
    pub settings_digest: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CacheManifest {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            item_ids: Vec::new(),
            item_digests: BTreeMap::new(),
            settings_digest: None,
            completed_at: Utc::now(),
        }
    }

    pub fn covers(&self, id: &str) -> bool {
        self.item_digests.contains_key(id) || self.item_ids.iter().any(|i| i == id)
    }

    /// Covered ids that are absent from `current`
    pub fn removed_ids(&self, current: &BTreeSet<String>) -> Vec<String> {
        self.item_ids
            .iter()
            .filter(|id| !current.contains(*id))
            .cloned()
            .collect()
    }
}

/// Cached reduce output for a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseArtifact {
    pub fingerprint: String,
    /// Digest of the reduce strategy that produced `output`
    #[serde(default)]
    pub reduce_digest: Option<String>,
    /// Ids of the results reduced into `output`, in item order
    #[serde(default)]
    pub item_ids: Vec<String>,
    /// Digest over those results
    #[serde(default)]
    pub results_digest: Option<String>,
    pub output: Value,
    pub saved_at: DateTime<Utc>,
}

impl PhaseArtifact {
    pub fn new(fingerprint: impl Into<String>, reduce_digest: impl Into<String>, output: Value) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            reduce_digest: Some(reduce_digest.into()),
            item_ids: Vec::new(),
            results_digest: None,
            output,
            saved_at: Utc::now(),
        }
    }

    pub fn with_coverage(mut self, item_ids: Vec<String>, results_digest: impl Into<String>) -> Self {
        self.item_ids = item_ids;
        self.results_digest = Some(results_digest.into());
        self
    }

    /// Whether `output` was reduced from exactly these results
    pub fn covers(&self, item_ids: &[String], results_digest: &str) -> bool {
        self.item_ids == item_ids && self.results_digest.as_deref() == Some(results_digest)
    }
}
