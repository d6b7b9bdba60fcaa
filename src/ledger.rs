//! Persisted set of content fingerprints used to skip already-processed bytes.
//!
//! The ledger is a plain text file with one hex SHA-256 per line. `record`
//! appends; nothing is ever rewritten. Recording is not transactional with the
//! work it guards, so a crash in between can replay one item, never lose one.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::VaultError;

/// Fingerprint of a file's bytes together with the name it arrived under
pub fn fingerprint(content: &[u8], path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(content);
    hex::encode(hasher.finalize())
}

pub struct DedupeLedger {
    path: PathBuf,
    seen: HashSet<String>,
}

impl DedupeLedger {
    /// Open the ledger, loading anything recorded by earlier runs
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let path = path.into();
        let seen = match fs::read_to_string(&path) {
            Ok(data) => data
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(VaultError::io(&path, e)),
        };
        debug!(ledger = %path.display(), entries = seen.len(), "dedupe ledger loaded");
        Ok(Self { path, seen })
    }

    pub fn seen(&self, fp: &str) -> bool {
        self.seen.contains(fp)
    }

    /// Persist a fingerprint. Recording one twice is harmless.
    ///
    /// The in-memory set only learns a fingerprint once it is on disk, so a
    /// failed write is retried by the next call.
    pub fn record(&mut self, fp: &str) -> Result<(), VaultError> {
        if self.seen.contains(fp) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| VaultError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| VaultError::io(&self.path, e))?;
        file.write_all(format!("{}\n", fp).as_bytes())
            .map_err(|e| VaultError::io(&self.path, e))?;
        self.seen.insert(fp.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fingerprint_depends_on_name_and_content() {
        let a = fingerprint(b"invoice", Path::new("/v/Needs_Action/a.md"));
        let same_name_elsewhere = fingerprint(b"invoice", Path::new("/v/In_Progress/x/a.md"));
        let other_name = fingerprint(b"invoice", Path::new("/v/Needs_Action/b.md"));
        let other_content = fingerprint(b"fee", Path::new("/v/Needs_Action/a.md"));

        assert_eq!(a.len(), 64);
        assert_eq!(a, same_name_elsewhere);
        assert_ne!(a, other_name);
        assert_ne!(a, other_content);
    }

    #[test]
    fn test_record_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger");

        let mut ledger = DedupeLedger::open(&path).unwrap();
        assert!(ledger.is_empty());
        ledger.record("abc").unwrap();
        ledger.record("abc").unwrap();
        ledger.record("def").unwrap();
        assert!(ledger.seen("abc"));
        assert!(!ledger.seen("zzz"));

        let reopened = DedupeLedger::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.seen("def"));
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_failed_write_is_not_remembered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger");
        let mut ledger = DedupeLedger::open(&path).unwrap();

        // The ledger path is unusable as a file
        fs::create_dir(&path).unwrap();
        assert!(ledger.record("abc").is_err());
        assert!(!ledger.seen("abc"));
        assert!(ledger.record("abc").is_err());
        assert!(!ledger.seen("abc"));

        fs::remove_dir(&path).unwrap();
        ledger.record("abc").unwrap();
        assert!(ledger.seen("abc"));
        assert!(DedupeLedger::open(&path).unwrap().seen("abc"));
    }
}
