//! Nexuts: the Information Center holding the fleet-wide merge prefix tree,
//! the WAL/snapshot pipeline, the Sentry/worker registry, and the routing
//! endpoint (spec.md §1, [MODULE C3]/[MODULE C4]/[MODULE C5]/[MODULE C7] IC
//! half/[MODULE C8]).

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod router;

use config::IcConfig;
use dashmap::DashMap;
use error::{IcError, IcResult};
use nexuts_common::{OpBatch, PodType, WorkerId};
use nexuts_metrics::QueueDepths;
use nexuts_store::Registry;
use nexuts_tree::MergeTree;
use nexuts_wal::{SnapshotConfig, SnapshotManager, WalConfig, WalEntry, WalManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A worker known to the IC, mirrored from `register`/`set_status`/
/// `deregister` calls (spec.md §6 "HTTP (IC)").
#[derive(Debug)]
pub struct WorkerEntry {
    pub pod_type: PodType,
    pub sentry_id: String,
    pub node_ip: String,
    pub service_port: u16,
    /// `true` = available for routing; flipped by `set_status`/Sentry loss,
    /// never deleted by a status change (spec.md §4.6 "IC → sentry").
    pub status: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct SentryEntry {
    pub ip: String,
    pub port: u16,
}

/// Shared state behind the IC HTTP surface and its background tasks.
pub struct IcState {
    pub config: IcConfig,
    pub tree: Arc<MergeTree>,
    pub wal: Arc<WalManager>,
    pub snapshot_mgr: Arc<SnapshotManager>,
    pub store: Registry,
    pub workers: DashMap<String, WorkerEntry>,
    pub sentries: DashMap<String, SentryEntry>,
    pub metrics: DashMap<WorkerId, QueueDepths>,
    pub client: reqwest::Client,
    /// Tracks which sentries already have a [`crate::health::spawn_sentry_watcher`]
    /// task running, so registering the same sentry twice doesn't spawn a
    /// duplicate watcher.
    pub sentry_watchers: DashMap<String, ()>,
}

impl IcState {
    pub async fn new(config: IcConfig) -> IcResult<Self> {
        let store = Registry::open(config.db_path()).map_err(IcError::from)?;
        let wal = WalManager::open(WalConfig::new(config.wal_dir()))
            .await
            .map_err(IcError::from)?;
        let tree = Arc::new(MergeTree::new());
        let snapshot_mgr = Arc::new(SnapshotManager::new(
            tree.clone(),
            wal.clone(),
            SnapshotConfig {
                dir: config.snapshot_dir(),
                interval_seconds: config.snapshot_interval_seconds,
                resume: config.resume,
            },
        ));

        let state = Self {
            config,
            tree,
            wal,
            snapshot_mgr,
            store,
            workers: DashMap::new(),
            sentries: DashMap::new(),
            metrics: DashMap::new(),
            client: reqwest::Client::new(),
            sentry_watchers: DashMap::new(),
        };
        state.reload_registry()?;
        Ok(state)
    }

    /// Reloads the in-memory worker/sentry tables from the durable store on
    /// startup, mirroring each worker's `status` as persisted.
    fn reload_registry(&self) -> IcResult<()> {
        for sentry in self.store.load_all_sentries().map_err(IcError::from)? {
            self.sentries.insert(
                sentry.sentry_id,
                SentryEntry {
                    ip: sentry.ip,
                    port: sentry.port,
                },
            );
        }
        for instance in self.store.load_all_instances().map_err(IcError::from)? {
            self.workers.insert(
                instance.instance_id,
                WorkerEntry {
                    pod_type: instance.pod_type,
                    sentry_id: instance.sentry_id,
                    node_ip: String::new(),
                    service_port: instance.service_port,
                    status: AtomicBool::new(instance.status),
                },
            );
        }
        Ok(())
    }

    pub async fn recover(&self) -> IcResult<()> {
        self.snapshot_mgr.recover().await.map_err(IcError::from)
    }

    pub fn register_sentry(&self, sentry_id: &str, ip: &str, port: u16) -> IcResult<()> {
        self.store.upsert_sentry(sentry_id, ip, port).map_err(IcError::from)?;
        self.sentries.insert(
            sentry_id.to_string(),
            SentryEntry {
                ip: ip.to_string(),
                port,
            },
        );
        Ok(())
    }

    pub fn register_worker(
        &self,
        instance_id: &str,
        pod_type: PodType,
        sentry_id: &str,
        node_ip: &str,
        service_port: u16,
        tp_size: u32,
        base_gpu_id: u32,
        step: u32,
    ) -> IcResult<()> {
        self.store
            .upsert_instance(sentry_id, instance_id, pod_type, service_port, tp_size, base_gpu_id, step, true)
            .map_err(IcError::from)?;
        self.workers.insert(
            instance_id.to_string(),
            WorkerEntry {
                pod_type,
                sentry_id: sentry_id.to_string(),
                node_ip: node_ip.to_string(),
                service_port,
                status: AtomicBool::new(true),
            },
        );
        Ok(())
    }

    /// `status: true = lost, false = recovered` (spec.md §6
    /// `POST /v1/Nexuts/set_status`).
    pub fn set_status(&self, sentry_id: &str, instance_id: &str, lost: bool) -> IcResult<()> {
        let available = !lost;
        self.store
            .set_instance_status(sentry_id, instance_id, available)
            .map_err(IcError::from)?;
        match self.workers.get(instance_id) {
            Some(entry) => {
                entry.status.store(available, Ordering::SeqCst);
                Ok(())
            }
            None => Err(IcError::NotFound(format!("instance {instance_id} not registered"))),
        }
    }

    pub fn deregister_worker(&self, sentry_id: &str, instance_id: &str) -> IcResult<()> {
        self.workers.remove(instance_id);
        self.tree.evict_by_worker(&WorkerId::from(instance_id.to_string()));
        self.store.delete_instance(sentry_id, instance_id).map_err(IcError::from)?;
        Ok(())
    }

    /// Marks every worker registered behind `sentry_id` unavailable without
    /// deleting them (spec.md §4.6 "IC → sentry").
    pub fn mark_sentry_lost(&self, sentry_id: &str) {
        for mut entry in self.workers.iter_mut() {
            if entry.sentry_id == sentry_id {
                entry.status.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Clears the `status = false` flip applied by [`Self::mark_sentry_lost`]
    /// once the Sentry watcher observes the sentry responding again.
    pub fn mark_sentry_recovered(&self, sentry_id: &str) {
        for mut entry in self.workers.iter_mut() {
            if entry.sentry_id == sentry_id {
                entry.status.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Accepts an incoming batch, releases every batch now in order
    /// (possibly more than one, possibly none), applies each to the tree,
    /// and durably WAL-appends every op before returning (spec.md §4.2
    /// "Write path and WAL").
    pub async fn accept_and_apply(&self, batch: OpBatch) -> IcResult<()> {
        let ready = self.tree.accept_batch(batch);
        for ready_batch in ready {
            let (versions, _report) = self.tree.apply_batch(&ready_batch);
            for (idx, version) in versions.into_iter().enumerate() {
                let update = &ready_batch.updates[idx];
                let entry = WalEntry {
                    global_version: version,
                    sentry_id: ready_batch.sentry_id.clone(),
                    sentry_ops_id: ready_batch.sentry_ops_id,
                    op: update.op.clone(),
                    instance_id: update.instance_id.clone(),
                };
                self.wal.append(&entry, true).await.map_err(IcError::from)?;
            }
        }
        Ok(())
    }

    /// Workers currently eligible for routing: `status == true` and with a
    /// cached metrics reading (spec.md §4.7 "Collect all status == true
    /// workers and their metrics").
    pub fn available_with_metrics(&self) -> std::collections::HashMap<WorkerId, QueueDepths> {
        self.workers
            .iter()
            .filter(|e| e.status.load(Ordering::SeqCst))
            .filter_map(|e| {
                let worker = WorkerId::from(e.key().clone());
                self.metrics.get(&worker).map(|d| (worker, *d))
            })
            .collect()
    }
}
