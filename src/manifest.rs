//! Manifest and diff types
//!
//! A [`Manifest`] is a declarative list of files with sizes and checksums,
//! representing an expected file-system state. Manifests are immutable once
//! loaded and only ever replaced wholesale: the local manifest is rewritten
//! as one atomic unit after a Process phase succeeds, never mutated
//! entry-by-entry.
//!
//! [`DiffInfo`] classifies the files of two manifests into added, modified,
//! and deleted sets. The three sets are pairwise disjoint and cover every
//! path that differs between the two manifests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

use crate::error::{ManifestError, Result};

/// One file in a manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the content base directory, with `/` separators
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Lowercase hex MD5 digest of the file contents
    pub checksum: String,
}

impl ManifestEntry {
    /// Create an entry
    pub fn new(path: impl Into<String>, size: u64, checksum: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size,
            checksum: checksum.into(),
        }
    }
}

/// A named, sized, checksummed file list with a corruption-detecting signature
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Content version string (opaque to the engine)
    pub version: String,
    /// SHA-256 hex digest over `version` and all entries, detects local
    /// corruption on load
    pub signature: String,
    /// Manifest entries, stable order for iteration
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest, computing its signature
    ///
    /// Fails if two entries share a path.
    pub fn new(version: impl Into<String>, entries: Vec<ManifestEntry>) -> Result<Self> {
        let version = version.into();
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(entry.path.as_str()) {
                return Err(ManifestError::DuplicatePath {
                    path: entry.path.clone(),
                }
                .into());
            }
        }
        let signature = compute_signature(&version, &entries);
        Ok(Self {
            version,
            signature,
            entries,
        })
    }

    /// An empty manifest (used when no local baseline exists yet)
    pub fn empty() -> Self {
        let signature = compute_signature("", &[]);
        Self {
            version: String::new(),
            signature,
            entries: Vec::new(),
        }
    }

    /// Total declared size of all entries
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Whether the stored signature matches the entries
    pub fn verify_signature(&self) -> bool {
        self.signature == compute_signature(&self.version, &self.entries)
    }

    /// Load and verify a manifest from local storage
    ///
    /// A missing file maps to [`ManifestError::NotFound`]; an unparsable
    /// file, duplicate paths, or a signature mismatch map to
    /// [`ManifestError::Corrupt`]. Both are recoverable conditions that the
    /// Preprocess phase answers with bundled-asset extraction.
    pub fn load(path: &Path) -> std::result::Result<Self, ManifestError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManifestError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => {
                return Err(ManifestError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("read failed: {e}"),
                });
            }
        };

        let manifest: Manifest =
            serde_json::from_slice(&raw).map_err(|e| ManifestError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("invalid JSON: {e}"),
            })?;

        let mut seen = HashSet::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            if !seen.insert(entry.path.as_str()) {
                return Err(ManifestError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("duplicate path {}", entry.path),
                });
            }
        }

        if !manifest.verify_signature() {
            return Err(ManifestError::Corrupt {
                path: path.to_path_buf(),
                reason: "signature mismatch".to_string(),
            });
        }

        debug!(
            path = %path.display(),
            version = %manifest.version,
            entries = manifest.entries.len(),
            "loaded local manifest"
        );
        Ok(manifest)
    }

    /// Persist the manifest atomically (write to a temp file, then rename)
    ///
    /// The rename is the commit point: a crash mid-save leaves either the old
    /// manifest or the new one, never a torn file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), version = %self.version, "saved local manifest");
        Ok(())
    }

    /// Three-way diff against a remote manifest
    ///
    /// Hash-join on path, then checksum comparison: present in remote but not
    /// locally is `added`; present in both with differing checksum is
    /// `modified`; present locally but not in remote is `deleted`. Output
    /// sets are sorted by path for deterministic iteration. Side-effect free.
    pub fn diff(&self, remote: &Manifest) -> DiffInfo {
        let local: HashMap<&str, &ManifestEntry> = self
            .entries
            .iter()
            .map(|e| (e.path.as_str(), e))
            .collect();
        let remote_paths: HashSet<&str> =
            remote.entries.iter().map(|e| e.path.as_str()).collect();

        let mut added = Vec::new();
        let mut modified = Vec::new();
        for entry in &remote.entries {
            match local.get(entry.path.as_str()) {
                None => added.push(entry.clone()),
                Some(local_entry) if local_entry.checksum != entry.checksum => {
                    modified.push(entry.clone());
                }
                Some(_) => {}
            }
        }

        let mut deleted: Vec<ManifestEntry> = self
            .entries
            .iter()
            .filter(|e| !remote_paths.contains(e.path.as_str()))
            .cloned()
            .collect();

        added.sort_by(|a, b| a.path.cmp(&b.path));
        modified.sort_by(|a, b| a.path.cmp(&b.path));
        deleted.sort_by(|a, b| a.path.cmp(&b.path));

        DiffInfo {
            added,
            modified,
            deleted,
        }
    }
}

/// Classification of files into added/modified/deleted between two manifests
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffInfo {
    /// Present in remote, absent locally (remote entries)
    pub added: Vec<ManifestEntry>,
    /// Present in both with differing checksum (remote entries)
    pub modified: Vec<ManifestEntry>,
    /// Present locally, absent in remote (local entries)
    pub deleted: Vec<ManifestEntry>,
}

impl DiffInfo {
    /// Whether nothing differs
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Total declared bytes across added and modified entries
    pub fn pending_bytes(&self) -> u64 {
        self.added
            .iter()
            .chain(self.modified.iter())
            .map(|e| e.size)
            .sum()
    }
}

fn compute_signature(version: &str, entries: &[ManifestEntry]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.as_bytes());
    hasher.update([0u8]);
    for entry in entries {
        hasher.update(entry.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.size.to_le_bytes());
        hasher.update(entry.checksum.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn entry(path: &str, size: u64, checksum: &str) -> ManifestEntry {
        ManifestEntry::new(path, size, checksum)
    }

    fn manifest(version: &str, entries: Vec<ManifestEntry>) -> Manifest {
        Manifest::new(version, entries).unwrap()
    }

    #[test]
    fn new_rejects_duplicate_paths() {
        let result = Manifest::new(
            "1.0",
            vec![entry("a.pak", 1, "aa"), entry("a.pak", 2, "bb")],
        );
        assert!(matches!(
            result,
            Err(crate::error::Error::Manifest(
                ManifestError::DuplicatePath { .. }
            ))
        ));
    }

    #[test]
    fn diff_classifies_added_modified_deleted() {
        let local = manifest(
            "1.0",
            vec![
                entry("same.pak", 10, "aa"),
                entry("changed.pak", 20, "bb"),
                entry("gone.pak", 30, "cc"),
            ],
        );
        let remote = manifest(
            "2.0",
            vec![
                entry("same.pak", 10, "aa"),
                entry("changed.pak", 22, "b2"),
                entry("new.pak", 40, "dd"),
            ],
        );

        let diff = local.diff(&remote);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].path, "new.pak");
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].path, "changed.pak");
        assert_eq!(
            diff.modified[0].checksum, "b2",
            "modified set must carry the remote entry"
        );
        assert_eq!(diff.deleted.len(), 1);
        assert_eq!(diff.deleted[0].path, "gone.pak");
    }

    #[test]
    fn diff_sets_are_pairwise_disjoint_and_cover_differences() {
        let local = manifest(
            "1.0",
            vec![
                entry("a", 1, "h1"),
                entry("b", 2, "h2"),
                entry("c", 3, "h3"),
            ],
        );
        let remote = manifest(
            "2.0",
            vec![
                entry("b", 2, "h2x"),
                entry("c", 3, "h3"),
                entry("d", 4, "h4"),
            ],
        );
        let diff = local.diff(&remote);

        let added: HashSet<_> = diff.added.iter().map(|e| e.path.as_str()).collect();
        let modified: HashSet<_> = diff.modified.iter().map(|e| e.path.as_str()).collect();
        let deleted: HashSet<_> = diff.deleted.iter().map(|e| e.path.as_str()).collect();

        assert!(added.is_disjoint(&modified));
        assert!(added.is_disjoint(&deleted));
        assert!(modified.is_disjoint(&deleted));

        let mut union: HashSet<&str> = HashSet::new();
        union.extend(&added);
        union.extend(&modified);
        union.extend(&deleted);
        assert_eq!(
            union,
            HashSet::from(["a", "b", "d"]),
            "every differing path appears in exactly one set"
        );
    }

    #[test]
    fn diff_of_identical_manifests_is_empty() {
        let entries = vec![entry("a", 1, "h1"), entry("b", 2, "h2")];
        let local = manifest("1.0", entries.clone());
        let remote = manifest("1.0", entries);
        assert!(local.diff(&remote).is_empty());
    }

    #[test]
    fn diff_against_empty_local_marks_everything_added() {
        let local = Manifest::empty();
        let remote = manifest("1.0", vec![entry("a", 10, "h1"), entry("b", 0, "h2")]);
        let diff = local.diff(&remote);
        assert_eq!(diff.added.len(), 2);
        assert!(diff.modified.is_empty());
        assert!(diff.deleted.is_empty());
        assert_eq!(diff.pending_bytes(), 10);
    }

    #[test]
    fn diff_output_is_sorted_by_path() {
        let local = Manifest::empty();
        let remote = manifest(
            "1.0",
            vec![entry("z", 1, "h"), entry("a", 1, "h"), entry("m", 1, "h")],
        );
        let paths: Vec<_> = local
            .diff(&remote)
            .added
            .iter()
            .map(|e| e.path.clone())
            .collect();
        assert_eq!(paths, vec!["a", "m", "z"]);
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = Manifest::load(&dir.path().join("manifest.json"));
        assert!(matches!(result, Err(ManifestError::NotFound { .. })));
    }

    #[test]
    fn load_rejects_invalid_json_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            Manifest::load(&path),
            Err(ManifestError::Corrupt { .. })
        ));
    }

    #[test]
    fn load_rejects_tampered_entries_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let m = manifest("1.0", vec![entry("a.pak", 10, "aa")]);
        m.save(&path).unwrap();

        // Flip an entry size without recomputing the signature.
        let mut raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        raw["entries"][0]["size"] = serde_json::json!(11);
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        match Manifest::load(&path) {
            Err(ManifestError::Corrupt { reason, .. }) => {
                assert!(reason.contains("signature"), "reason was: {reason}");
            }
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let m = manifest("3.1", vec![entry("a", 5, "h1"), entry("b/c", 7, "h2")]);
        m.save(&path).unwrap();
        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded, m);
        assert!(
            !path.with_extension("json.tmp").exists(),
            "temp file must be renamed away"
        );
    }

    #[test]
    fn empty_manifest_passes_its_own_signature_check() {
        assert!(Manifest::empty().verify_signature());
        assert_eq!(Manifest::empty().total_size(), 0);
    }
}
