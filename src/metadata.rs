//! Local metadata cache
//!
//! The board's directory listing reports size only, so a local edit that
//! leaves the file the same size is invisible to the mirror diff. This
//! cache remembers {mtime, size, checksum} per uploaded file and flags a
//! file as modified when its content hash no longer matches what was last
//! shipped. Persisted as a JSON sidecar inside the sync folder.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Modification time in milliseconds since the epoch.
    pub mtime_ms: i64,
    pub size: u64,
    /// Hex blake3 of the file content at last successful upload.
    pub checksum: String,
}

pub struct MetadataStore {
    path: PathBuf,
    entries: HashMap<String, FileMeta>,
}

impl MetadataStore {
    /// Load the cache, starting empty if the file is missing or corrupt.
    /// A corrupt cache only costs redundant re-uploads, never correctness.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!("metadata cache {} unreadable, starting fresh: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let raw = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, raw)
    }

    pub fn get(&self, name: &str) -> Option<&FileMeta> {
        self.entries.get(name)
    }

    /// Whether a local file differs from what was last uploaded.
    ///
    /// Cheap path first: matching size and mtime means unchanged. On any
    /// drift the content is re-hashed; a matching hash refreshes the cached
    /// stat fields instead of forcing an upload (a touched-but-identical
    /// file is common slicer behavior).
    pub fn is_modified(&mut self, name: &str, path: &Path) -> std::io::Result<bool> {
        let stat = std::fs::metadata(path)?;
        let size = stat.len();
        let mtime_ms = mtime_millis(stat.modified()?);

        let Some(known) = self.entries.get(name) else {
            return Ok(true);
        };
        if known.size == size && known.mtime_ms == mtime_ms {
            return Ok(false);
        }
        let checksum = hash_file(path)?;
        if checksum == known.checksum {
            self.entries.insert(
                name.to_string(),
                FileMeta {
                    mtime_ms,
                    size,
                    checksum,
                },
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Record a successful upload of `name` from `path`.
    pub fn record_uploaded(&mut self, name: &str, path: &Path) -> std::io::Result<()> {
        let stat = std::fs::metadata(path)?;
        let meta = FileMeta {
            mtime_ms: mtime_millis(stat.modified()?),
            size: stat.len(),
            checksum: hash_file(path)?,
        };
        self.entries.insert(name.to_string(), meta);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Drop cache entries for files no longer present locally.
    pub fn retain_local<F: Fn(&str) -> bool>(&mut self, exists_locally: F) {
        self.entries.retain(|name, _| exists_locally(name));
    }
}

fn mtime_millis(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Streaming blake3 of a file, hex encoded.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_unknown_file_is_modified() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ctb");
        fs::write(&file, b"data").unwrap();

        let mut store = MetadataStore::load(&dir.path().join("meta.json"));
        assert!(store.is_modified("a.ctb", &file).unwrap());
    }

    #[test]
    fn test_uploaded_file_is_clean_until_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ctb");
        fs::write(&file, b"version one").unwrap();

        let mut store = MetadataStore::load(&dir.path().join("meta.json"));
        store.record_uploaded("a.ctb", &file).unwrap();
        assert!(!store.is_modified("a.ctb", &file).unwrap());

        // Same size, different content: the hash must catch it.
        // mtime_ms is millisecond-resolution, so make sure the rewrite
        // lands on a later timestamp than the recorded one.
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(&file, b"version two").unwrap();
        assert!(store.is_modified("a.ctb", &file).unwrap());
    }

    #[test]
    fn test_touched_identical_file_refreshes_without_upload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ctb");
        fs::write(&file, b"stable content").unwrap();

        let mut store = MetadataStore::load(&dir.path().join("meta.json"));
        store.record_uploaded("a.ctb", &file).unwrap();

        // Rewrite identical bytes; mtime drifts but the hash matches
        fs::write(&file, b"stable content").unwrap();
        assert!(!store.is_modified("a.ctb", &file).unwrap());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ctb");
        let cache = dir.path().join("meta.json");
        fs::write(&file, b"data").unwrap();

        let mut store = MetadataStore::load(&cache);
        store.record_uploaded("a.ctb", &file).unwrap();
        store.save().unwrap();

        let reloaded = MetadataStore::load(&cache);
        assert_eq!(reloaded.get("a.ctb"), store.get("a.ctb"));
    }

    #[test]
    fn test_corrupt_cache_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("meta.json");
        fs::write(&cache, b"{ not json").unwrap();

        let store = MetadataStore::load(&cache);
        assert!(store.get("anything").is_none());
    }

    #[test]
    fn test_retain_local_purges_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.ctb");
        fs::write(&file, b"data").unwrap();

        let mut store = MetadataStore::load(&dir.path().join("meta.json"));
        store.record_uploaded("a.ctb", &file).unwrap();
        store.record_uploaded("b.ctb", &file).unwrap();
        store.retain_local(|name| name == "a.ctb");
        assert!(store.get("a.ctb").is_some());
        assert!(store.get("b.ctb").is_none());
    }
}
