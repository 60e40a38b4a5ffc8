//! Per-worker health watching and restart reseeding (spec.md [MODULE C7]
//! Sentry half, §4.6). Generalizes `knhk-sidecar::health::HealthChecker`'s
//! single-process liveness/readiness split from "one process's own health"
//! to "N workers' health", one `tokio::task` per worker.

use crate::{SentryState, WorkerEntry};
use std::sync::Arc;
use std::time::Duration;

const WORKER_HEALTH_TIMEOUT: Duration = Duration::from_secs(1);
const WORKER_HEALTH_RETRIES: u32 = 5;
const RECOVERY_WAIT: Duration = Duration::from_secs(30);

async fn probe_worker(client: &reqwest::Client, node_ip: &str, service_port: u16) -> bool {
    let url = format!("http://{node_ip}:{service_port}/v1/pdserver/health");
    client
        .get(&url)
        .timeout(WORKER_HEALTH_TIMEOUT)
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

/// Spawns the watcher loop for one worker. Pings every `health_interval`;
/// on failure retries up to [`WORKER_HEALTH_RETRIES`] at a fixed 1s
/// interval; if still down, reports loss to the IC and waits up to
/// [`RECOVERY_WAIT`] for the worker to re-register before deregistering it
/// locally (spec.md §4.6 "Sentry → worker").
pub fn spawn_worker_watcher(state: Arc<SentryState>, instance_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let health_interval = Duration::from_secs_f64(state.config.health_interval_secs.max(0.1));
        loop {
            tokio::time::sleep(health_interval).await;

            let Some(entry) = state.workers.get(&instance_id).map(|e| e.value().clone()) else {
                // deregistered by another path (e.g. explicit deregister call) — stop watching.
                return;
            };

            let mut healthy = probe_worker(&state.client, &entry.node_ip, entry.service_port).await;
            let mut attempts = 0;
            while !healthy && attempts < WORKER_HEALTH_RETRIES {
                tokio::time::sleep(Duration::from_secs(1)).await;
                healthy = probe_worker(&state.client, &entry.node_ip, entry.service_port).await;
                attempts += 1;
            }

            if healthy {
                continue;
            }

            tracing::warn!(instance_id = %instance_id, "worker health lost after retries");
            if let Err(e) = state.notify_ic_status(&instance_id, true).await {
                tracing::error!(error = %e, instance_id = %instance_id, "failed to notify IC of worker loss");
            }

            tokio::time::sleep(RECOVERY_WAIT).await;
            let recovered = probe_worker(&state.client, &entry.node_ip, entry.service_port).await;
            if recovered {
                if let Err(e) = state.notify_ic_status(&instance_id, false).await {
                    tracing::error!(error = %e, instance_id = %instance_id, "failed to notify IC of worker recovery");
                }
                continue;
            }

            tracing::warn!(instance_id = %instance_id, "worker did not recover in time, deregistering");
            if let Err(e) = state.deregister_worker(&instance_id) {
                tracing::error!(error = %e, instance_id = %instance_id, "failed to deregister lost worker");
            }
            return;
        }
    })
}

/// On Sentry process start: reload the worker list from the local store,
/// health-check each, reseed prefill workers' trees from the worker's own
/// `/v1/radixtree/full`, and re-announce every restored worker to the IC
/// (spec.md §4.6 "Restart").
pub async fn restart_reload(state: Arc<SentryState>) {
    let instances = match state.store.instances_for_sentry(&state.config.sentry_id) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "failed to load worker list from local store on restart");
            return;
        }
    };

    for record in instances {
        // The `instance` table has no ip column (spec.md §6 schema): a
        // worker and its Sentry run on the same host, so loopback is the
        // right address to re-probe on restart.
        let entry = WorkerEntry {
            instance_id: record.instance_id.clone(),
            pod_type: record.pod_type,
            node_ip: "127.0.0.1".to_string(),
            service_port: record.service_port,
            tp_size: record.tp_size,
            base_gpu_id: record.base_gpu_id,
            step: record.step,
        };

        let healthy = probe_worker(&state.client, &entry.node_ip, entry.service_port).await;
        if !healthy {
            tracing::warn!(instance_id = %entry.instance_id, "restart reseed: worker unhealthy, skipping");
            continue;
        }

        if matches!(entry.pod_type, nexuts_common::PodType::Prefill) {
            if let Err(e) = reseed_from_full_tree(&state, &entry).await {
                tracing::error!(error = %e, instance_id = %entry.instance_id, "failed to reseed prefill tree on restart");
            }
        }

        if let Err(e) = state.register_worker(entry.clone()) {
            tracing::error!(error = %e, instance_id = %entry.instance_id, "failed to re-register restored worker locally");
            continue;
        }
        if let Err(e) = state.register_with_ic(&entry).await {
            tracing::error!(error = %e, instance_id = %entry.instance_id, "failed to re-announce restored worker to IC");
        }
        spawn_worker_watcher(state.clone(), entry.instance_id);
    }
}

async fn reseed_from_full_tree(state: &Arc<SentryState>, entry: &WorkerEntry) -> crate::error::SentryResult<()> {
    let url = format!("http://{}:{}/v1/radixtree/full", entry.node_ip, entry.service_port);
    let resp = state
        .client
        .get(&url)
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .map_err(|e| crate::error::SentryError::Transient(format!("radixtree/full fetch failed: {e}")))?;
    let full: nexuts_common::dto::RadixTreeFullResponse = resp
        .json()
        .await
        .map_err(|e| crate::error::SentryError::Transient(format!("radixtree/full decode failed: {e}")))?;
    // Mirrors `Sentry/Manager/register.py`'s reload path: `recover_tree(r["tree"])`
    // rebuilds the per-worker tree from the blob, then `ops_id_next` resumes
    // one past the recovered cursor.
    state.tree.rebuild_from_dict(&full.tree);
    state.ops_id_finished.store(full.ops_id_finished, std::sync::atomic::Ordering::SeqCst);
    Ok(())
}
