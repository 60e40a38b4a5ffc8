//! Snapshot manager implementing the copy-on-write protocol of spec.md
//! §4.3, grounded on `original_source/Nexuts/persistence/snap_manager.py`.
//! The Python original pickles a BFS-ordered node list; this crate uses
//! `bincode` + `zstd` framing instead (spec.md §6 "a compressed ... generic
//! frame codec" — `bincode` is already a teacher dependency via
//! `knhk-etl`/`knhk-lockchain`, and `zstd` is the natural extension for
//! "compressed").

use crate::error::{WalError, WalResult};
use crate::wal::{WalEntry, WalManager};
use nexuts_common::WorkerId;
use nexuts_tree::{MergeTree, NodeId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    id: NodeId,
    edge_key: Vec<nexuts_common::Token>,
    value: std::collections::HashMap<WorkerId, Vec<nexuts_common::SlotId>>,
    children: Vec<NodeId>,
    version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    global_version: u64,
    records: Vec<SnapshotRecord>,
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub dir: PathBuf,
    pub interval_seconds: u64,
    pub resume: bool,
}

/// Produces point-in-time images of a [`MergeTree`] without blocking
/// mutators, coordinating WAL rotation, and rebuilding the tree on recovery
/// (spec.md [MODULE C5]).
pub struct SnapshotManager {
    tree: Arc<MergeTree>,
    wal: Arc<WalManager>,
    config: SnapshotConfig,
}

impl SnapshotManager {
    pub fn new(tree: Arc<MergeTree>, wal: Arc<WalManager>, config: SnapshotConfig) -> Self {
        Self { tree, wal, config }
    }

    /// Boot sequence: load the latest snapshot (if any), rebuild the tree,
    /// then replay the tail WAL through the same mutation path with WAL
    /// writes disabled (spec.md §4.3 "Recovery").
    pub async fn recover(&self) -> WalResult<()> {
        tokio::fs::create_dir_all(&self.config.dir).await?;
        if !self.config.resume {
            return Ok(());
        }

        match self.load_latest_snapshot()? {
            Some(file) => {
                let global_version = file.global_version;
                let records = file
                    .records
                    .into_iter()
                    .map(|r| (r.id, r.edge_key, r.value, r.children, r.version))
                    .collect();
                self.tree.rebuild_from_snapshot(records, global_version);
                tracing::info!(global_version, "loaded snapshot");
            }
            None => {
                tracing::info!(dir = %self.config.dir.display(), "no snapshot found, starting from empty tree");
            }
        }

        let replay = self.wal.load_resume_records()?;
        for entry in replay {
            let worker = WorkerId::from(entry.instance_id.clone());
            self.tree.apply_replayed(&worker, &entry.op, entry.global_version);
        }
        Ok(())
    }

    fn snapshot_glob(&self) -> WalResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.config.dir.exists() {
            return Ok(files);
        }
        for entry in std::fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "snap").unwrap_or(false) {
                files.push(path);
            }
        }
        // Filenames are zero-padded timestamps, so lexicographic order is
        // chronological (spec.md §4.3 "Recovery").
        files.sort();
        Ok(files)
    }

    fn load_latest_snapshot(&self) -> WalResult<Option<SnapshotFile>> {
        let files = self.snapshot_glob()?;
        let latest = match files.last() {
            Some(p) => p,
            None => return Ok(None),
        };
        match read_snapshot_file(latest) {
            Ok(file) => Ok(Some(file)),
            Err(e) => {
                tracing::error!(path = %latest.display(), error = %e, "snapshot unreadable, falling back to empty tree + full WAL replay");
                Ok(None)
            }
        }
    }

    /// Runs the five-step protocol of spec.md §4.3 and returns the final
    /// snapshot file path.
    pub async fn take_snapshot(&self) -> WalResult<PathBuf> {
        // Step 1: freeze version.
        let (v_snap, f_snap) = self.tree.begin_snapshot();
        tracing::info!(v_snap, f_snap, "snapshot: version frozen");

        // Step 2: rotate the WAL, prepending the in-flight tail.
        let copy_last_n = v_snap.saturating_sub(f_snap);
        self.wal.rotate(copy_last_n).await?;

        // Step 3 (copy-on-write) happens implicitly on concurrent mutators
        // via `MergeTree::apply_batch` consulting `snap_version()`.

        // Step 4: BFS serializer walk.
        let tree = self.tree.clone();
        let records = tokio::task::spawn_blocking(move || tree.bfs_snapshot(v_snap))
            .await
            .map_err(|e| WalError::Fatal(format!("snapshot BFS task panicked: {e}")))?;
        let node_count = records.len();
        let snapshot_records: Vec<SnapshotRecord> = records
            .into_iter()
            .map(|(id, frozen)| SnapshotRecord {
                id,
                edge_key: frozen.edge_key,
                value: frozen.value,
                children: frozen.children.into_iter().map(|(_, id)| id).collect(),
                version: frozen.version,
            })
            .collect();

        // Step 5: commit.
        let filename = snapshot_filename(v_snap, node_count);
        let final_path = self.config.dir.join(&filename);
        let tmp_path = self.config.dir.join(format!("{filename}.tmp"));
        write_snapshot_file(&tmp_path, &SnapshotFile {
            global_version: v_snap,
            records: snapshot_records,
        })?;
        std::fs::rename(&tmp_path, &final_path)?;
        fsync_parent(&final_path)?;

        self.wal.commit().await?;
        self.tree.end_snapshot();
        self.cleanup_old_snapshots(&final_path)?;
        tracing::info!(path = %final_path.display(), node_count, "snapshot committed");
        Ok(final_path)
    }

    fn cleanup_old_snapshots(&self, keep: &Path) -> WalResult<()> {
        for path in self.snapshot_glob()? {
            if path != keep {
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(())
    }

    /// Spawns the periodic `tokio::time::interval` snapshot loop (the
    /// teacher's `original_source` equivalent is `_auto_snapshot_loop`'s
    /// background thread).
    pub fn spawn_periodic(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(self.config.interval_seconds.max(1)));
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if let Err(e) = self.take_snapshot().await {
                    tracing::error!(error = %e, "periodic snapshot failed");
                }
            }
        })
    }
}

fn snapshot_filename(v_snap: u64, node_count: usize) -> String {
    // `chrono::Local::now()` stands in for the teacher's
    // `datetime.now().strftime(...)` timestamp.
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    format!("snap_{ts}_{v_snap}_{node_count}.snap")
}

fn write_snapshot_file(path: &Path, file: &SnapshotFile) -> WalResult<()> {
    let encoded = bincode::serialize(file).map_err(|e| WalError::Serialization(e.to_string()))?;
    let compressed = zstd::encode_all(&encoded[..], 3).map_err(WalError::Io)?;
    let mut f = std::fs::File::create(path)?;
    use std::io::Write;
    f.write_all(&compressed)?;
    f.sync_all()?;
    Ok(())
}

fn read_snapshot_file(path: &Path) -> WalResult<SnapshotFile> {
    let compressed = std::fs::read(path)?;
    let decoded = zstd::decode_all(&compressed[..])
        .map_err(|e| WalError::Corruption(format!("zstd decode failed: {e}")))?;
    bincode::deserialize(&decoded).map_err(|e| WalError::Corruption(format!("bincode decode failed: {e}")))
}

fn fsync_parent(path: &Path) -> WalResult<()> {
    if let Some(parent) = path.parent() {
        let f = std::fs::File::open(parent)?;
        f.sync_all()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalConfig;
    use nexuts_common::{SlotId, Token};
    use nexuts_tree::ROOT_ID;
    use tempfile::tempdir;

    #[tokio::test]
    async fn snapshot_round_trip_preserves_payloads() {
        let wal_dir = tempdir().unwrap();
        let snap_dir = tempdir().unwrap();
        let wal = WalManager::open(WalConfig::new(wal_dir.path())).await.unwrap();
        let tree = Arc::new(MergeTree::new());

        let w1 = WorkerId::from("w1");
        tree.core()
            .insert_at(ROOT_ID, &[Token(10), Token(20), Token(30)], &[SlotId(1), SlotId(2), SlotId(3)], &w1, None, 1)
            .unwrap();

        let mgr = SnapshotManager::new(
            tree.clone(),
            wal.clone(),
            SnapshotConfig {
                dir: snap_dir.path().to_path_buf(),
                interval_seconds: 600,
                resume: true,
            },
        );
        let path = mgr.take_snapshot().await.unwrap();
        assert!(path.exists());

        let tree2 = Arc::new(MergeTree::new());
        let wal2_dir = tempdir().unwrap();
        std::fs::copy(wal.log_path(), wal2_dir.path().join("log.logs")).ok();
        let wal2 = WalManager::open(WalConfig::new(wal2_dir.path())).await.unwrap();
        let mgr2 = SnapshotManager::new(
            tree2.clone(),
            wal2,
            SnapshotConfig {
                dir: snap_dir.path().to_path_buf(),
                interval_seconds: 600,
                resume: true,
            },
        );
        mgr2.recover().await.unwrap();
        let found = tree2.search_instances_with_prefix(&[Token(10), Token(20)]);
        assert!(found.contains(&w1));
    }

    #[test]
    fn snapshot_filenames_sort_chronologically() {
        let a = snapshot_filename(1, 1);
        assert!(a.starts_with("snap_"));
    }
}
