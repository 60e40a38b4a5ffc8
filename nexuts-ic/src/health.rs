//! IC-side half of [MODULE C7] (spec.md §4.6 "IC → sentry") plus the
//! worker `/metrics` polling loop that feeds the router (spec.md §6
//! "Metrics scraping"). Grounded on
//! `knhk-consensus::network::PeerDiscovery`'s peer-liveness bookkeeping,
//! generalized from "peer" to "sentry".

use crate::IcState;
use std::sync::Arc;
use std::time::Duration;

/// Spawns the watcher task for `sentry_id` unless one is already running.
/// One task per registered Sentry: pings `GET {sentry}/v1/health` every
/// `sentry_hearbeat` seconds; on failure, every worker behind that sentry
/// is marked `status = false` without being deleted (spec.md §4.6
/// "IC → sentry" — routing just skips them). A sentry that starts
/// responding again clears the loss for its workers.
pub fn spawn_sentry_watcher(state: Arc<IcState>, sentry_id: String) -> Option<tokio::task::JoinHandle<()>> {
    if state.sentry_watchers.insert(sentry_id.clone(), ()).is_some() {
        return None;
    }
    Some(tokio::spawn(async move {
        let interval = Duration::from_secs_f64(state.config.sentry_heartbeat_secs.max(0.1));
        let mut lost = false;
        loop {
            tokio::time::sleep(interval).await;

            let Some(sentry) = state.sentries.get(&sentry_id).map(|e| e.value().clone()) else {
                // deregistered entirely — stop watching.
                state.sentry_watchers.remove(&sentry_id);
                return;
            };

            let url = format!("http://{}:{}/v1/health", sentry.ip, sentry.port);
            let healthy = state
                .client
                .get(&url)
                .timeout(Duration::from_secs(1))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);

            if !healthy && !lost {
                tracing::warn!(sentry_id = %sentry_id, "sentry unreachable, marking its workers unavailable");
                state.mark_sentry_lost(&sentry_id);
                lost = true;
            } else if healthy && lost {
                tracing::info!(sentry_id = %sentry_id, "sentry reachable again, clearing worker loss");
                state.mark_sentry_recovered(&sentry_id);
                lost = false;
            }
        }
    }))
}

/// Spawns a watcher for every sentry already known at startup (reloaded
/// from the durable registry by [`IcState::reload_registry`]).
pub fn spawn_known_sentry_watchers(state: Arc<IcState>) {
    let ids: Vec<String> = state.sentries.iter().map(|e| e.key().clone()).collect();
    for sentry_id in ids {
        spawn_sentry_watcher(state.clone(), sentry_id);
    }
}

/// Periodically scrapes every registered worker's `/metrics` endpoint and
/// caches the extracted queue depths for the router to read (spec.md §6
/// "Metrics scraping"). A scrape failure keeps the last-known value rather
/// than clearing it (spec.md §7 "Transient I/O").
pub fn spawn_metrics_poller(state: Arc<IcState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs_f64(state.config.metrics_poll_interval_secs.max(0.1));
        loop {
            tokio::time::sleep(interval).await;

            let targets: Vec<(nexuts_common::WorkerId, String, u16, nexuts_common::PodType)> = state
                .workers
                .iter()
                .map(|e| {
                    (
                        nexuts_common::WorkerId::from(e.key().clone()),
                        e.node_ip.clone(),
                        e.service_port,
                        e.pod_type,
                    )
                })
                .collect();

            for (worker, ip, port, pod_type) in targets {
                if ip.is_empty() {
                    continue;
                }
                match nexuts_metrics::scrape(&state.client, &ip, port, pod_type).await {
                    Ok(depths) => {
                        state.metrics.insert(worker, depths);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, worker = %worker, "metrics scrape failed, keeping last-known value");
                    }
                }
            }
        }
    })
}
