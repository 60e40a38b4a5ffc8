//! Outbound pipeline shipping locally-applied radix ops up to the IC
//! (spec.md [MODULE C6]). Grounded on
//! `original_source/Sentry/PushWithNexuts/push_to_nexuts.py`'s
//! `_collect_loop`/`_send_loop` split, with the durable FIFO realized as
//! byte-ordered keys in an embedded `sled::Db` (the teacher's root
//! `Cargo.toml` notes `sled` as the "alternative for persistence layer" for
//! exactly this kind of embedded-KV need), and the periodic-tick shape
//! following `knhk-sidecar::batching::Batcher`.

use crate::error::{SentryError, SentryResult};
use nexuts_common::{BatchReport, OpBatch, PendingUpdate};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SENTRY_OPS_ID_KEY: &[u8] = b"sentry_ops_id";
const SENTRY_OPS_ID_FINISH_KEY: &[u8] = b"sentry_ops_id_finish";
const QUEUE_PREFIX: &[u8] = b"q:";

fn queue_key(sentry_ops_id: u64) -> Vec<u8> {
    let mut key = QUEUE_PREFIX.to_vec();
    key.extend_from_slice(&sentry_ops_id.to_be_bytes());
    key
}

/// Stage 1 of C6: every locally-applied op lands here until the next flush
/// tick sweeps it into the durable queue.
#[derive(Default)]
struct ActiveBuffer {
    updates: Vec<PendingUpdate>,
}

/// Drives the three C6 stages for one Sentry process. The durable FIFO is
/// realized as byte-ordered keys in a single `sled::Db` (big-endian
/// `sentry_ops_id` sorts the queue in delivery order) per the teacher's
/// root `Cargo.toml` note that `sled` is the "alternative for persistence
/// layer" for embedded-KV needs.
pub struct OutboundPipeline {
    sentry_id: String,
    nexuts_base_url: String,
    client: reqwest::Client,
    buffer: Mutex<ActiveBuffer>,
    db: sled::Db,
    next_ops_id: AtomicU64,
}

impl OutboundPipeline {
    pub fn open(sentry_id: impl Into<String>, nexuts_base_url: impl Into<String>, queue_path: impl AsRef<std::path::Path>) -> SentryResult<Self> {
        let db = sled::open(queue_path).map_err(|e| SentryError::Fatal(format!("failed to open outbound queue: {e}")))?;
        let next_ops_id = db
            .get(SENTRY_OPS_ID_KEY)
            .ok()
            .flatten()
            .and_then(|v| v.as_ref().try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0);
        Ok(Self {
            sentry_id: sentry_id.into(),
            nexuts_base_url: nexuts_base_url.into(),
            client: reqwest::Client::new(),
            buffer: Mutex::new(ActiveBuffer::default()),
            db,
            next_ops_id: AtomicU64::new(next_ops_id),
        })
    }

    /// Stage 1: pushes one applied op's IC-facing record into the active
    /// buffer.
    pub fn push(&self, update: PendingUpdate) {
        self.buffer.lock().updates.push(update);
    }

    fn persisted_ops_id_finish(&self) -> u64 {
        self.db
            .get(SENTRY_OPS_ID_FINISH_KEY)
            .ok()
            .flatten()
            .and_then(|v| v.as_ref().try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0)
    }

    /// Stage 2: on a flush tick, if the buffer is non-empty, assigns the
    /// next `sentry_ops_id`, assembles the batch payload, and atomically
    /// pushes it onto the durable queue while persisting the counter
    /// (spec.md §4.5 stage 2).
    pub fn flush_to_queue(&self) -> SentryResult<()> {
        let updates = {
            let mut buf = self.buffer.lock();
            if buf.updates.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut buf.updates)
        };

        let sentry_ops_id = self.next_ops_id.fetch_add(1, Ordering::SeqCst) + 1;
        let batch = OpBatch {
            sentry_id: self.sentry_id.clone(),
            sentry_ops_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            updates,
        };
        let value = serde_json::to_vec(&batch).map_err(|e| SentryError::Fatal(format!("failed to serialize batch: {e}")))?;

        let mut write_batch = sled::Batch::default();
        write_batch.insert(queue_key(sentry_ops_id), value);
        write_batch.insert(SENTRY_OPS_ID_KEY, sentry_ops_id.to_be_bytes().to_vec());
        self.db
            .apply_batch(write_batch)
            .map_err(|e| SentryError::Transient(format!("failed to persist outbound batch: {e}")))?;

        Ok(())
    }

    /// Returns the oldest un-acknowledged batch in the durable queue, if
    /// any (stage 3, "peek head").
    pub fn peek_head(&self) -> SentryResult<Option<OpBatch>> {
        match self.db.scan_prefix(QUEUE_PREFIX).next() {
            None => Ok(None),
            Some(Ok((_, value))) => {
                let batch: OpBatch = serde_json::from_slice(&value).map_err(|e| SentryError::Fatal(format!("corrupt queued batch: {e}")))?;
                Ok(Some(batch))
            }
            Some(Err(e)) => Err(SentryError::Transient(format!("failed to read outbound queue: {e}"))),
        }
    }

    /// Stage 3: ships the head batch to the IC; on 2xx, pops it and
    /// persists `sentry_ops_id_finish`. Any failure leaves the head in
    /// place for the next tick (spec.md §4.5 stage 3, §7 "Transient I/O").
    pub async fn ship_head(&self) -> SentryResult<()> {
        let Some(batch) = self.peek_head()? else {
            return Ok(());
        };

        let url = format!("{}/v1/Nexuts/update_prefix_tree", self.nexuts_base_url);
        let body = nexuts_common::dto::UpdatePrefixTreeRequest {
            timestamp: batch.timestamp.clone(),
            sentry_ops_id: batch.sentry_ops_id,
            sentry_id: batch.sentry_id.clone(),
            updates: batch.updates.clone(),
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(2))
            .send()
            .await;

        let ok = match resp {
            Ok(r) if r.status().is_success() => true,
            Ok(r) => {
                tracing::warn!(status = %r.status(), sentry_ops_id = batch.sentry_ops_id, "IC rejected outbound batch");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, sentry_ops_id = batch.sentry_ops_id, "outbound batch POST failed");
                false
            }
        };

        if ok {
            let mut write_batch = sled::Batch::default();
            write_batch.remove(queue_key(batch.sentry_ops_id));
            write_batch.insert(SENTRY_OPS_ID_FINISH_KEY, batch.sentry_ops_id.to_be_bytes().to_vec());
            self.db
                .apply_batch(write_batch)
                .map_err(|e| SentryError::Transient(format!("failed to pop acked batch: {e}")))?;
        }
        Ok(())
    }

    pub fn ops_id_finished(&self) -> u64 {
        self.persisted_ops_id_finish()
    }
}

/// Spawns the stage-2 and stage-3 periodic tasks; returns their join
/// handles so `main` can hold them for the process lifetime.
pub fn spawn(
    pipeline: Arc<OutboundPipeline>,
    flush_interval: Duration,
    send_interval: Duration,
) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let flush_pipeline = pipeline.clone();
    let flush_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(flush_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = flush_pipeline.flush_to_queue() {
                tracing::error!(error = %e, "outbound flush-to-queue failed");
            }
        }
    });

    let send_pipeline = pipeline;
    let send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(send_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = send_pipeline.ship_head().await {
                tracing::error!(error = %e, "outbound ship-head failed");
            }
        }
    });

    (flush_task, send_task)
}

/// Builds the [`BatchReport`] for a locally-applied set of ops, pushing
/// every successfully-applied one into the pipeline's active buffer.
pub fn record_and_buffer(
    pipeline: &OutboundPipeline,
    instance_id: &str,
    results: impl IntoIterator<Item = (nexuts_common::RadixOp, SentryResult<()>)>,
) -> BatchReport {
    let mut report = BatchReport::default();
    for (index, (op, result)) in results.into_iter().enumerate() {
        match result {
            Ok(()) => {
                pipeline.push(PendingUpdate {
                    instance_id: instance_id.to_string(),
                    op,
                });
                report.push_ok(index);
            }
            Err(e) => report.push_err(index, e.to_string()),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexuts_common::RadixOp;

    fn pipeline() -> (tempfile::TempDir, OutboundPipeline) {
        let dir = tempfile::tempdir().unwrap();
        let p = OutboundPipeline::open("sentry-1", "http://127.0.0.1:0", dir.path().join("queue")).unwrap();
        (dir, p)
    }

    #[test]
    fn flush_is_noop_on_empty_buffer() {
        let (_dir, p) = pipeline();
        p.flush_to_queue().unwrap();
        assert!(p.peek_head().unwrap().is_none());
    }

    #[test]
    fn flush_assigns_monotonic_ops_id_and_persists() {
        let (_dir, p) = pipeline();
        p.push(PendingUpdate {
            instance_id: "w1".to_string(),
            op: RadixOp::InsertNode {
                parent_path: vec![],
                prompt: vec![nexuts_common::Token(1)],
                prompt_value: vec![nexuts_common::SlotId(1)],
            },
        });
        p.flush_to_queue().unwrap();
        let head = p.peek_head().unwrap().unwrap();
        assert_eq!(head.sentry_ops_id, 1);
        assert_eq!(head.updates.len(), 1);

        p.push(PendingUpdate {
            instance_id: "w1".to_string(),
            op: RadixOp::InsertNode {
                parent_path: vec![],
                prompt: vec![nexuts_common::Token(2)],
                prompt_value: vec![nexuts_common::SlotId(2)],
            },
        });
        p.flush_to_queue().unwrap();
        // head is still ops_id 1 until it's shipped and popped.
        let head = p.peek_head().unwrap().unwrap();
        assert_eq!(head.sentry_ops_id, 1);
    }
}
