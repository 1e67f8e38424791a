//! Remote directory mirror and reconciliation planning
//!
//! Snapshots are immutable once captured; every scan builds a new one, so a
//! plan computed from a snapshot pair can never be invalidated midway. The
//! remote listing is the source of truth for what the board holds.

use crate::error::ProtocolError;
use crate::protocol::{self, timeouts, Command};
use crate::session::Session;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// One file in the sync folder at scan time.
#[derive(Debug, Clone)]
pub struct LocalFileRecord {
    pub name: String,
    pub size: u64,
    pub mtime: SystemTime,
}

/// Immutable snapshot of the sync folder, keyed by filename.
#[derive(Debug, Clone, Default)]
pub struct LocalSnapshot {
    pub files: BTreeMap<String, LocalFileRecord>,
}

/// One file on the board's storage as reported by the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileRecord {
    pub name: String,
    pub size: u64,
}

/// Immutable snapshot of the board's storage.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub files: BTreeMap<String, RemoteFileRecord>,
}

impl RemoteSnapshot {
    pub fn from_records<I: IntoIterator<Item = (String, u64)>>(records: I) -> Self {
        let files = records
            .into_iter()
            .map(|(name, size)| (name.clone(), RemoteFileRecord { name, size }))
            .collect();
        Self { files }
    }
}

/// Enumerate print files in the sync folder. Flat scan; the board has no
/// concept of directories.
pub fn scan_local(folder: &Path) -> std::io::Result<LocalSnapshot> {
    let mut files = BTreeMap::new();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !protocol::is_print_file(&name) {
            continue;
        }
        // Unreadable entries are skipped, not fatal: the file may be
        // mid-write by the slicer.
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.insert(
            name.clone(),
            LocalFileRecord {
                name,
                size: meta.len(),
                mtime,
            },
        );
    }
    Ok(LocalSnapshot { files })
}

/// Query the board's file listing. Holds the command gate for the whole
/// multi-line reply since the protocol cannot interleave.
pub async fn list_remote(session: &mut Session) -> Result<RemoteSnapshot, ProtocolError> {
    session.send_line(&Command::ListFiles.encode()).await?;
    let mut records = Vec::new();
    loop {
        let line = session
            .read_line(timeouts::COMMAND_MS, "file list")
            .await?;
        if line == protocol::FILE_LIST_END {
            break;
        }
        if line == protocol::FILE_LIST_BEGIN {
            continue;
        }
        if let Some(entry) = protocol::parse_list_entry(&line) {
            records.push(entry);
        }
        // Anything else is firmware chatter; the listing has explicit
        // begin/end sentinels so stray lines are safe to skip.
    }
    // Absorb the ok that closes the listing
    session
        .read_line(timeouts::COMMAND_MS, "file list ok")
        .await?;
    let snapshot = RemoteSnapshot::from_records(records);
    debug!("remote listing: {} file(s)", snapshot.files.len());
    Ok(snapshot)
}

/// One reconciliation operation against the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOp {
    Upload(String),
    Delete(String),
}

impl PlanOp {
    pub fn file_name(&self) -> &str {
        match self {
            PlanOp::Upload(name) | PlanOp::Delete(name) => name,
        }
    }
}

impl fmt::Display for PlanOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanOp::Upload(name) => write!(f, "upload {name}"),
            PlanOp::Delete(name) => write!(f, "delete {name}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// When false, files present only on the board are left alone.
    pub remote_delete: bool,
}

/// Ordered operation list derived from one snapshot pair. Discarded and
/// recomputed whole; never patched in place.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationPlan {
    pub ops: Vec<PlanOp>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Diff a snapshot pair into a plan.
///
/// Deletes come before uploads so remote space frees up first. A remote
/// entry whose size differs from the local file is stale and re-uploaded
/// in place (the board's write command overwrites); it is never deleted
/// first. `modified` carries names whose content changed without a size
/// change, which the listing alone cannot see.
pub fn compute_plan(
    local: &LocalSnapshot,
    remote: &RemoteSnapshot,
    modified: &HashSet<String>,
    opts: &PlanOptions,
) -> ReconciliationPlan {
    let mut ops = Vec::new();

    if opts.remote_delete {
        for name in remote.files.keys() {
            if !local.files.contains_key(name) {
                ops.push(PlanOp::Delete(name.clone()));
            }
        }
    }

    for (name, record) in &local.files {
        let needs_upload = match remote.files.get(name) {
            None => true,
            Some(remote_record) => remote_record.size != record.size || modified.contains(name),
        };
        if needs_upload {
            ops.push(PlanOp::Upload(name.clone()));
        }
    }

    ReconciliationPlan { ops }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(entries: &[(&str, u64)]) -> LocalSnapshot {
        let files = entries
            .iter()
            .map(|&(name, size)| {
                (
                    name.to_string(),
                    LocalFileRecord {
                        name: name.to_string(),
                        size,
                        mtime: SystemTime::UNIX_EPOCH,
                    },
                )
            })
            .collect();
        LocalSnapshot { files }
    }

    fn remote(entries: &[(&str, u64)]) -> RemoteSnapshot {
        RemoteSnapshot::from_records(
            entries.iter().map(|&(n, s)| (n.to_string(), s)),
        )
    }

    fn plan(
        l: &LocalSnapshot,
        r: &RemoteSnapshot,
        remote_delete: bool,
    ) -> ReconciliationPlan {
        compute_plan(
            l,
            r,
            &HashSet::new(),
            &PlanOptions { remote_delete },
        )
    }

    #[test]
    fn test_new_local_file_uploads() {
        let p = plan(&local(&[("a.ctb", 10_485_760)]), &remote(&[]), true);
        assert_eq!(p.ops, vec![PlanOp::Upload("a.ctb".into())]);
    }

    #[test]
    fn test_matching_snapshots_give_empty_plan() {
        let p = plan(
            &local(&[("a.ctb", 10_485_760)]),
            &remote(&[("a.ctb", 10_485_760)]),
            true,
        );
        assert!(p.is_empty());
    }

    #[test]
    fn test_size_mismatch_reuploads_not_delete() {
        let p = plan(
            &local(&[("a.ctb", 2048)]),
            &remote(&[("a.ctb", 1024)]),
            true,
        );
        assert_eq!(p.ops, vec![PlanOp::Upload("a.ctb".into())]);
    }

    #[test]
    fn test_orphan_remote_deletes_when_enabled() {
        let p = plan(&local(&[]), &remote(&[("old.ctb", 500)]), true);
        assert_eq!(p.ops, vec![PlanOp::Delete("old.ctb".into())]);
    }

    #[test]
    fn test_orphan_remote_kept_when_deletion_disabled() {
        let p = plan(&local(&[]), &remote(&[("old.ctb", 500)]), false);
        assert!(p.is_empty());
    }

    #[test]
    fn test_deletes_ordered_before_uploads() {
        let p = plan(
            &local(&[("new.ctb", 100)]),
            &remote(&[("zzz_old.ctb", 500)]),
            true,
        );
        assert_eq!(
            p.ops,
            vec![
                PlanOp::Delete("zzz_old.ctb".into()),
                PlanOp::Upload("new.ctb".into()),
            ]
        );
    }

    #[test]
    fn test_exactly_one_op_per_differing_name() {
        let l = local(&[("same.ctb", 10), ("stale.ctb", 20), ("fresh.ctb", 30)]);
        let r = remote(&[("same.ctb", 10), ("stale.ctb", 25), ("orphan.ctb", 40)]);
        let p = plan(&l, &r, true);

        let mut names: Vec<&str> = p.ops.iter().map(|op| op.file_name()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["fresh.ctb", "orphan.ctb", "stale.ctb"]);
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn test_modified_flag_forces_upload_at_same_size() {
        let l = local(&[("edited.ctb", 1024)]);
        let r = remote(&[("edited.ctb", 1024)]);
        let mut modified = HashSet::new();
        modified.insert("edited.ctb".to_string());

        let p = compute_plan(&l, &r, &modified, &PlanOptions { remote_delete: true });
        assert_eq!(p.ops, vec![PlanOp::Upload("edited.ctb".into())]);
    }

    #[test]
    fn test_scan_local_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ctb"), b"1234").unwrap();
        std::fs::write(dir.path().join("b.goo"), b"12").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join(".chitusync_meta.json"), b"{}").unwrap();

        let snap = scan_local(dir.path()).unwrap();
        let names: Vec<&String> = snap.files.keys().collect();
        assert_eq!(names, vec!["a.ctb", "b.goo"]);
        assert_eq!(snap.files["a.ctb"].size, 4);
    }
}
