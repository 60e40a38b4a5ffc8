//! Write-ahead log (spec.md [MODULE C4]).
//!
//! Grounded on `original_source/Nexuts/persistence/walmanager.py`: a single
//! in-memory queue drained by one flusher, group-commit via one `write` plus
//! one `fdatasync`-equivalent per batch, and a `log.logs`/`log2.logs` pair of
//! files used for snapshot-synchronized rotation. The Python original uses a
//! raw background thread with a condition variable; this translates that
//! into the teacher's async idiom (`knhk-sidecar`'s batching/retry machinery
//! is all `tokio`-task based) — a `tokio::sync::Mutex`-protected deque plus a
//! dedicated flusher task woken by a `Notify`.

use crate::error::{WalError, WalResult};
use nexuts_common::RadixOp;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::File as AsyncFile;
use tokio::sync::{oneshot, Mutex, Notify};

/// One applied IC operation (spec.md §3 "WAL entry (C4)"), one line of
/// UTF-8 JSON terminated by `\n`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub global_version: u64,
    pub sentry_id: String,
    pub sentry_ops_id: u64,
    pub op: RadixOp,
    pub instance_id: String,
}

impl WalEntry {
    pub fn to_line(&self) -> WalResult<Vec<u8>> {
        let mut s = serde_json::to_vec(self).map_err(|e| WalError::Serialization(e.to_string()))?;
        s.push(b'\n');
        Ok(s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WalConfig {
    pub dir: PathBuf,
    pub log_name: String,
    pub rotated_name: String,
    pub flush_interval_ms: u64,
    pub max_batch: usize,
    pub rollover_bytes: u64,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            log_name: "log.logs".to_string(),
            rotated_name: "log2.logs".to_string(),
            flush_interval_ms: 10,
            max_batch: 4096,
            rollover_bytes: 256 * 1024 * 1024,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(&self.log_name)
    }

    pub fn rotated_path(&self) -> PathBuf {
        self.dir.join(&self.rotated_name)
    }
}

struct QueueEntry {
    data: Vec<u8>,
    completion: Option<oneshot::Sender<WalResult<()>>>,
}

struct Queue {
    items: VecDeque<QueueEntry>,
}

/// Append-only WAL manager: one active file, group-commit flusher, and a
/// rotation/commit protocol synchronized with [`crate::snapshot::SnapshotManager`].
pub struct WalManager {
    config: WalConfig,
    queue: Mutex<Queue>,
    notify: Notify,
    active_path: Mutex<PathBuf>,
    written_since_rollover: std::sync::atomic::AtomicU64,
    stop: AtomicBool,
}

impl WalManager {
    pub async fn open(config: WalConfig) -> WalResult<Arc<Self>> {
        tokio::fs::create_dir_all(&config.dir).await?;
        truncate_to_last_newline(&config.log_path())?;
        if config.rotated_path().exists() {
            truncate_to_last_newline(&config.rotated_path())?;
        }
        let log_path = config.log_path();
        let manager = Arc::new(Self {
            config,
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
            }),
            notify: Notify::new(),
            active_path: Mutex::new(log_path),
            written_since_rollover: std::sync::atomic::AtomicU64::new(0),
            stop: AtomicBool::new(false),
        });
        let flusher = manager.clone();
        tokio::spawn(async move {
            flusher.flusher_loop().await;
        });
        Ok(manager)
    }

    /// `append(entry, sync)` (spec.md §4.4). `sync = true` awaits the batch
    /// that contains this entry being fsynced; `sync = false` enqueues and
    /// returns immediately, durable within one flush interval.
    pub async fn append(&self, entry: &WalEntry, sync: bool) -> WalResult<()> {
        let data = entry.to_line()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut q = self.queue.lock().await;
            q.items.push_back(QueueEntry {
                data,
                completion: Some(tx),
            });
        }
        self.notify.notify_one();
        if sync {
            rx.await.map_err(|_| WalError::Fatal("flusher dropped completion".into()))?
        } else {
            Ok(())
        }
    }

    /// Inserts a zero-length sentinel entry and waits for it to be flushed;
    /// used before `rotate` and `commit` (spec.md §4.4 "barrier flush").
    pub async fn barrier_flush(&self) -> WalResult<()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut q = self.queue.lock().await;
            q.items.push_back(QueueEntry {
                data: Vec::new(),
                completion: Some(tx),
            });
        }
        self.notify.notify_one();
        rx.await.map_err(|_| WalError::Fatal("flusher dropped completion".into()))?
    }

    async fn flusher_loop(self: Arc<Self>) {
        let tick = std::time::Duration::from_millis(self.config.flush_interval_ms.max(1));
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            let batch = {
                let mut q = self.queue.lock().await;
                if q.items.is_empty() {
                    drop(q);
                    let _ = tokio::time::timeout(tick, self.notify.notified()).await;
                    q = self.queue.lock().await;
                }
                let mut batch = Vec::new();
                while let Some(item) = q.items.pop_front() {
                    batch.push(item);
                    if batch.len() >= self.config.max_batch {
                        break;
                    }
                }
                batch
            };
            if batch.is_empty() {
                continue;
            }
            let result = self.write_batch(&batch).await;
            for mut item in batch {
                if let Some(tx) = item.completion.take() {
                    let _ = tx.send(result.clone().map(|_| ()));
                }
            }
        }
    }

    async fn write_batch(&self, batch: &[QueueEntry]) -> WalResult<usize> {
        let payload: Vec<u8> = batch.iter().flat_map(|e| e.data.iter().copied()).collect();
        if payload.is_empty() {
            return Ok(0);
        }
        let path = self.active_path.lock().await.clone();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&payload).await?;
        sync_data(&mut file).await?;
        let total = self
            .written_since_rollover
            .fetch_add(payload.len() as u64, Ordering::Relaxed)
            + payload.len() as u64;
        if total > self.config.rollover_bytes {
            self.written_since_rollover.store(0, Ordering::Relaxed);
            tracing::info!(bytes = total, "WAL size-based rollover threshold crossed");
        }
        Ok(payload.len())
    }

    /// Step 2 of spec.md §4.3: switches the active write target from
    /// `log.logs` to `log2.logs`, prepending the last `copy_last_n` complete
    /// lines of `log.logs` to the head of `log2.logs` so the tail WAL alone
    /// (after commit) carries everything needed to catch the snapshot up to
    /// the live state.
    pub async fn rotate(&self, copy_last_n: u64) -> WalResult<()> {
        self.barrier_flush().await?;
        let log_path = self.config.log_path();
        let rotated_path = self.config.rotated_path();

        let prepend = if copy_last_n > 0 {
            read_last_n_complete_lines(&log_path, copy_last_n as usize)?
        } else {
            Vec::new()
        };

        {
            let mut f = std::fs::File::create(&rotated_path)?;
            f.write_all(&prepend)?;
            f.flush()?;
        }

        *self.active_path.lock().await = rotated_path;
        self.written_since_rollover.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Step 5 (WAL half) of spec.md §4.3: `log2.logs` → `log.logs`.
    pub async fn commit(&self) -> WalResult<()> {
        self.barrier_flush().await?;
        let log_path = self.config.log_path();
        let rotated_path = self.config.rotated_path();
        tokio::fs::rename(&rotated_path, &log_path).await?;
        fsync_dir(&self.config.dir)?;
        *self.active_path.lock().await = log_path;
        Ok(())
    }

    /// Reads every complete record from `log.logs` and, if present,
    /// `log2.logs`, in that order, without mutating either file (spec.md
    /// §4.3 "Recovery").
    pub fn load_resume_records(&self) -> WalResult<Vec<WalEntry>> {
        let mut out = Vec::new();
        out.extend(read_and_parse_all(&self.config.log_path())?);
        let rotated = self.config.rotated_path();
        if rotated.exists() {
            out.extend(read_and_parse_all(&rotated)?);
        }
        Ok(out)
    }

    pub fn log_path(&self) -> PathBuf {
        self.config.log_path()
    }

    pub fn rotated_path(&self) -> PathBuf {
        self.config.rotated_path()
    }

    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

impl Clone for WalError {
    fn clone(&self) -> Self {
        match self {
            WalError::Io(e) => WalError::Io(std::io::Error::new(e.kind(), e.to_string())),
            WalError::Serialization(s) => WalError::Serialization(s.clone()),
            WalError::Corruption(s) => WalError::Corruption(s.clone()),
            WalError::Fatal(s) => WalError::Fatal(s.clone()),
        }
    }
}

async fn sync_data(file: &mut AsyncFile) -> WalResult<()> {
    file.sync_data().await?;
    Ok(())
}

fn fsync_dir(dir: &Path) -> WalResult<()> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()?;
    Ok(())
}

/// Scans a WAL file and truncates it to the last complete `\n`-terminated
/// line, discarding a partial trailing entry (spec.md §4.4 "Crash
/// truncation", §7 "Corruption").
fn truncate_to_last_newline(path: &Path) -> WalResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut data = Vec::with_capacity(len as usize);
    file.read_to_end(&mut data)?;
    if data.last() == Some(&b'\n') {
        return Ok(());
    }
    let cut = data.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0);
    file.set_len(cut as u64)?;
    file.seek(SeekFrom::Start(cut as u64))?;
    file.sync_all()?;
    Ok(())
}

fn read_complete_lines(path: &Path) -> WalResult<Vec<Vec<u8>>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = std::fs::File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    let mut lines = Vec::new();
    let mut start = 0usize;
    for (i, b) in data.iter().enumerate() {
        if *b == b'\n' {
            lines.push(data[start..=i].to_vec());
            start = i + 1;
        }
    }
    Ok(lines)
}

fn read_last_n_complete_lines(path: &Path, n: usize) -> WalResult<Vec<u8>> {
    let lines = read_complete_lines(path)?;
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().flatten().copied().collect())
}

fn read_and_parse_all(path: &Path) -> WalResult<Vec<WalEntry>> {
    let lines = read_complete_lines(path)?;
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        let trimmed = &line[..line.len().saturating_sub(1)];
        if trimmed.is_empty() {
            continue; // barrier sentinel
        }
        match serde_json::from_slice::<WalEntry>(trimmed) {
            Ok(entry) => out.push(entry),
            Err(e) => tracing::warn!(error = %e, "skipping unparseable WAL line"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexuts_common::Token;
    use tempfile::tempdir;

    fn entry(v: u64) -> WalEntry {
        WalEntry {
            global_version: v,
            sentry_id: "s1".into(),
            sentry_ops_id: v,
            op: RadixOp::InsertNode {
                parent_path: vec![],
                prompt: vec![Token(v as u32)],
                prompt_value: vec![nexuts_common::SlotId(1)],
            },
            instance_id: "w1".into(),
        }
    }

    #[tokio::test]
    async fn append_sync_is_durable_after_await() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(WalConfig::new(dir.path())).await.unwrap();
        wal.append(&entry(1), true).await.unwrap();
        let records = wal.load_resume_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].global_version, 1);
    }

    #[tokio::test]
    async fn rotate_prepends_tail_then_commit_renames() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(WalConfig::new(dir.path())).await.unwrap();
        wal.append(&entry(1), true).await.unwrap();
        wal.append(&entry(2), true).await.unwrap();
        wal.append(&entry(3), true).await.unwrap();

        wal.rotate(2).await.unwrap();
        wal.append(&entry(4), true).await.unwrap();

        let rotated_records = read_and_parse_all(&wal.rotated_path()).unwrap();
        assert_eq!(rotated_records.len(), 3);
        assert_eq!(rotated_records[0].global_version, 2);
        assert_eq!(rotated_records[2].global_version, 4);

        wal.commit().await.unwrap();
        assert!(!wal.rotated_path().exists());
        let final_records = wal.load_resume_records().unwrap();
        assert_eq!(final_records.len(), 3);
    }

    #[test]
    fn truncates_partial_trailing_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.logs");
        std::fs::write(&path, b"{\"a\":1}\n{\"a\":2}\n{\"a\":3").unwrap();
        truncate_to_last_newline(&path).unwrap();
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data, b"{\"a\":1}\n{\"a\":2}\n");
    }
}
