//! Content fingerprints deciding whether cached results are still valid

use crate::error::Result;
use crate::splitter::Payload;
use git2::{ObjectType, Repository};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

/// SHA-256 hex over a sequence of parts.
///
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn content_fingerprint<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    format!("{:x}", hasher.finalize())
}

/// Digest of one item payload, stable across runs
pub fn payload_digest(payload: &Payload) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in payload {
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Git revision fingerprint for the repository containing `repo`.
///
/// With a `subtree`, the id of that tree at HEAD is returned, so commits
/// touching only other paths leave it unchanged. Otherwise the HEAD commit id.
pub fn git_fingerprint(repo: &Path, subtree: Option<&Path>) -> Result<String> {
    let repository = Repository::discover(repo)?;
    let commit = repository.head()?.peel_to_commit()?;

    let fingerprint = match subtree.filter(|p| !p.as_os_str().is_empty()) {
        Some(path) => {
            let entry = commit.tree()?.get_path(path)?;
            if entry.kind() != Some(ObjectType::Tree) {
                return Err(git2::Error::from_str(&format!(
                    "{} is not a directory at HEAD",
                    path.display()
                ))
                .into());
            }
            entry.id().to_string()
        }
        None => commit.id().to_string(),
    };

    debug!(fingerprint = %fingerprint, "Resolved git fingerprint");
    Ok(fingerprint)
}

/// Repository working directory containing `path`, and `path` relative to it
pub fn locate_in_repo(path: &Path) -> Result<(PathBuf, Option<PathBuf>)> {
    let repository = Repository::discover(path)?;
    let workdir = repository
        .workdir()
        .ok_or_else(|| git2::Error::from_str("bare repositories have no working directory"))?;

    let root = workdir.canonicalize()?;
    let target = path.canonicalize()?;
    let subtree = target
        .strip_prefix(&root)
        .ok()
        .map(Path::to_path_buf)
        .filter(|p| !p.as_os_str().is_empty());
    Ok((root, subtree))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::payload;
    use tempfile::TempDir;

    #[test]
    fn test_content_fingerprint_is_length_prefixed() {
        assert_eq!(content_fingerprint(["ab", "c"]), content_fingerprint(["ab", "c"]));
        assert_ne!(content_fingerprint(["ab", "c"]), content_fingerprint(["a", "bc"]));
        assert_eq!(content_fingerprint(["x"]).len(), 64);
    }

    #[test]
    fn test_payload_digest_tracks_values() {
        let a = payload(&[("path", "a.rs"), ("lang", "rust")]);
        let b = payload(&[("lang", "rust"), ("path", "a.rs")]);
        let c = payload(&[("path", "a.rs"), ("lang", "go")]);
        assert_eq!(payload_digest(&a), payload_digest(&b));
        assert_ne!(payload_digest(&a), payload_digest(&c));
    }

    #[test]
    fn test_git_subtree_fingerprint_ignores_other_paths() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo::init(dir.path());
        test_repo::commit(&repo, &[("src/lib.rs", "one"), ("docs/a.md", "a")], "init");

        let head_before = git_fingerprint(dir.path(), None).unwrap();
        let src_before = git_fingerprint(dir.path(), Some(Path::new("src"))).unwrap();

        test_repo::commit(&repo, &[("docs/a.md", "changed")], "docs");
        assert_ne!(git_fingerprint(dir.path(), None).unwrap(), head_before);
        assert_eq!(git_fingerprint(dir.path(), Some(Path::new("src"))).unwrap(), src_before);

        test_repo::commit(&repo, &[("src/lib.rs", "two")], "code");
        assert_ne!(git_fingerprint(dir.path(), Some(Path::new("src"))).unwrap(), src_before);
    }

    #[test]
    fn test_locate_in_repo() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo::init(dir.path());
        test_repo::commit(&repo, &[("src/lib.rs", "one")], "init");

        let (root, subtree) = locate_in_repo(&dir.path().join("src")).unwrap();
        assert_eq!(root, dir.path().canonicalize().unwrap());
        assert_eq!(subtree, Some(PathBuf::from("src")));

        let (_, subtree) = locate_in_repo(dir.path()).unwrap();
        assert!(subtree.is_none());
    }

    #[test]
    fn test_git_fingerprint_rejects_file_subtree() {
        let dir = TempDir::new().unwrap();
        let repo = test_repo::init(dir.path());
        test_repo::commit(&repo, &[("README.md", "hi")], "init");
        assert!(git_fingerprint(dir.path(), Some(Path::new("README.md"))).is_err());
    }
}
