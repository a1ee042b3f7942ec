//! Change detection between a completed manifest and the current batch

use super::manifest::CacheManifest;
use crate::error::Result;
use crate::fingerprint::payload_digest;
use crate::splitter::WorkItem;
use git2::{Delta, DiffOptions, Repository};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Decides which item ids changed since a manifest was written
pub trait ChangeDetector: Send + Sync {
    /// Ids among `items` whose cached results can no longer be trusted
    fn changed_ids(
        &self,
        manifest: &CacheManifest,
        fingerprint: &str,
        items: &[WorkItem],
    ) -> Result<BTreeSet<String>>;
}

/// Compares per-item payload digests against the manifest
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestChangeDetector;

impl ChangeDetector for DigestChangeDetector {
    fn changed_ids(
        &self,
        manifest: &CacheManifest,
        _fingerprint: &str,
        items: &[WorkItem],
    ) -> Result<BTreeSet<String>> {
        Ok(items
            .iter()
            .filter(|item| manifest.item_digests.get(&item.id) != Some(&payload_digest(&item.payload)))
            .map(|item| item.id.clone())
            .collect())
    }
}

/// Treats fingerprints as git revisions and maps changed paths to items.
///
/// An item is affected when its path field names a changed file or a
/// directory containing one.
#[derive(Debug, Clone)]
pub struct GitChangeDetector {
    repo: PathBuf,
    subtree: Option<PathBuf>,
    path_field: String,
}

impl GitChangeDetector {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            subtree: None,
            path_field: "path".to_string(),
        }
    }

    /// Fingerprints are tree ids of this subtree; diff paths are relative to it
    pub fn with_subtree(mut self, subtree: Option<PathBuf>) -> Self {
        self.subtree = subtree.filter(|p| !p.as_os_str().is_empty());
        self
    }

    pub fn with_path_field(mut self, field: impl Into<String>) -> Self {
        self.path_field = field.into();
        self
    }

    /// Repository-relative paths changed between two revisions
    pub fn changed_paths(&self, from: &str, to: &str) -> Result<BTreeSet<PathBuf>> {
        let repo = Repository::discover(&self.repo)?;
        let old_tree = repo.revparse_single(from)?.peel_to_tree()?;
        let new_tree = repo.revparse_single(to)?.peel_to_tree()?;

        let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut DiffOptions::new()))?;

        let mut paths = BTreeSet::new();
        for delta in diff.deltas() {
            if delta.status() == Delta::Unmodified {
                continue;
            }
            for file in [delta.old_file(), delta.new_file()] {
                if let Some(path) = file.path() {
                    let full = match &self.subtree {
                        Some(subtree) => subtree.join(path),
                        None => path.to_path_buf(),
                    };
                    paths.insert(full);
                }
            }
        }
        Ok(paths)
    }

    fn affects(item_path: &Path, changed: &BTreeSet<PathBuf>) -> bool {
        changed.iter().any(|path| path.starts_with(item_path))
    }
}

impl ChangeDetector for GitChangeDetector {
    fn changed_ids(
        &self,
        manifest: &CacheManifest,
        fingerprint: &str,
        items: &[WorkItem],
    ) -> Result<BTreeSet<String>> {
        if manifest.fingerprint == fingerprint {
            return Ok(BTreeSet::new());
        }

        let changed = self.changed_paths(&manifest.fingerprint, fingerprint)?;
        debug!(
            from = %manifest.fingerprint,
            to = %fingerprint,
            "{} paths changed",
            changed.len()
        );

        Ok(items
            .iter()
            .filter(|item| {
                item.field(&self.path_field)
                    .is_some_and(|value| Self::affects(Path::new(value.trim_start_matches("./")), &changed))
            })
            .map(|item| item.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{git_fingerprint, test_repo};
    use crate::testing::payload;
    use tempfile::TempDir;

    fn item(id: &str, path: &str) -> WorkItem {
        WorkItem::new(id, payload(&[("path", path)]), 0, 1)
    }

    #[test]
    fn test_digest_detector_flags_changed_and_unknown_items() {
        let items = vec![item("a", "a.rs"), item("b", "b.rs"), item("c", "c.rs")];
        let mut manifest = CacheManifest::new("fp");
        manifest
            .item_digests
            .insert("a".to_string(), payload_digest(&items[0].payload));
        manifest
            .item_digests
            .insert("b".to_string(), payload_digest(&payload(&[("path", "old.rs")])));

        let changed = DigestChangeDetector.changed_ids(&manifest, "fp", &items).unwrap();
        assert_eq!(changed, BTreeSet::from(["b".to_string(), "c".to_string()]));
    }

    #[test]
    fn test_git_detector_maps_paths_to_items() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo::init(dir.path());
        let first = test_repo::commit(
            &repo,
            &[("src/a.rs", "a"), ("src/b.rs", "b"), ("docs/guide.md", "g")],
            "init",
        );
        let second = test_repo::commit(&repo, &[("src/a.rs", "a2"), ("docs/guide.md", "g2")], "edit");

        let items = vec![item("a", "src/a.rs"), item("b", "src/b.rs"), item("docs", "docs")];
        let manifest = CacheManifest::new(first);
        let changed = GitChangeDetector::new(dir.path())
            .changed_ids(&manifest, &second, &items)
            .unwrap();

        assert_eq!(changed, BTreeSet::from(["a".to_string(), "docs".to_string()]));
    }

    #[test]
    fn test_git_detector_with_subtree_tree_ids() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo::init(dir.path());
        test_repo::commit(&repo, &[("src/a.rs", "a"), ("src/b.rs", "b")], "init");
        let before = git_fingerprint(dir.path(), Some(Path::new("src"))).unwrap();
        test_repo::commit(&repo, &[("src/b.rs", "b2")], "edit");
        let after = git_fingerprint(dir.path(), Some(Path::new("src"))).unwrap();

        let items = vec![item("a", "src/a.rs"), item("b", "src/b.rs")];
        let detector = GitChangeDetector::new(dir.path()).with_subtree(Some(PathBuf::from("src")));
        let changed = detector
            .changed_ids(&CacheManifest::new(before), &after, &items)
            .unwrap();

        assert_eq!(changed, BTreeSet::from(["b".to_string()]));
    }

    #[test]
    fn test_git_detector_same_fingerprint_is_unchanged() {
        let items = vec![item("a", "src/a.rs")];
        let changed = GitChangeDetector::new("/nonexistent")
            .changed_ids(&CacheManifest::new("abc"), "abc", &items)
            .unwrap();
        assert!(changed.is_empty());
    }
}
