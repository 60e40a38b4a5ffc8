//! Sentry: the per-host agent that mirrors one worker's radix cache index,
//! watches worker health, and streams mutations up to the IC (spec.md §1,
//! [MODULE C2]/[MODULE C6]/[MODULE C7] Sentry half).

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod pipeline;

use config::SentryConfig;
use dashmap::DashMap;
use error::{SentryError, SentryResult};
use nexuts_common::PodType;
use nexuts_store::Registry;
use nexuts_tree::RadixTree;
use pipeline::OutboundPipeline;
use std::sync::Arc;

/// One worker this Sentry watches, mirrored from its self-registration
/// (spec.md §6 "HTTP (Sentry)").
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub instance_id: String,
    pub pod_type: PodType,
    pub node_ip: String,
    pub service_port: u16,
    pub tp_size: u32,
    pub base_gpu_id: u32,
    pub step: u32,
}

/// Shared state behind the Sentry HTTP surface and its background tasks.
pub struct SentryState {
    pub config: SentryConfig,
    pub tree: RadixTree,
    pub store: Registry,
    pub pipeline: Arc<OutboundPipeline>,
    pub workers: DashMap<String, WorkerEntry>,
    pub client: reqwest::Client,
    pub ops_id_finished: std::sync::atomic::AtomicU64,
}

impl SentryState {
    pub fn new(config: SentryConfig) -> SentryResult<Self> {
        let store = Registry::open(config.instance_db_path())?;
        let pipeline = Arc::new(OutboundPipeline::open(
            config.sentry_id.clone(),
            config.nexuts_base_url.clone(),
            &config.outbound_queue_path,
        )?);
        Ok(Self {
            config,
            tree: RadixTree::new(),
            store,
            pipeline,
            workers: DashMap::new(),
            client: reqwest::Client::new(),
            ops_id_finished: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn register_worker(&self, entry: WorkerEntry) -> SentryResult<()> {
        self.store.upsert_instance(
            &self.config.sentry_id,
            &entry.instance_id,
            entry.pod_type,
            entry.service_port,
            entry.tp_size,
            entry.base_gpu_id,
            entry.step,
            true,
        )?;
        self.workers.insert(entry.instance_id.clone(), entry);
        Ok(())
    }

    pub fn deregister_worker(&self, instance_id: &str) -> SentryResult<()> {
        self.workers.remove(instance_id);
        self.store.delete_instance(&self.config.sentry_id, instance_id)?;
        Ok(())
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.workers.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn notify_ic_status(&self, instance_id: &str, lost: bool) -> SentryResult<()> {
        let url = format!("{}/v1/Nexuts/set_status", self.config.nexuts_base_url);
        let body = nexuts_common::dto::SetStatusRequest {
            sentry_id: self.config.sentry_id.clone(),
            instance_id: instance_id.to_string(),
            status: lost,
        };
        self.client
            .post(&url)
            .json(&body)
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await
            .map_err(|e| SentryError::Transient(format!("set_status to IC failed: {e}")))?;
        Ok(())
    }

    pub async fn register_with_ic(&self, entry: &WorkerEntry) -> SentryResult<()> {
        let (host, port) = self
            .config
            .bind_address
            .rsplit_once(':')
            .ok_or_else(|| SentryError::Fatal("invalid bind_address".to_string()))?;
        let sentry_port: u16 = port.parse().map_err(|_| SentryError::Fatal("invalid bind_address port".to_string()))?;
        let sentry_ip = if host == "0.0.0.0" { "127.0.0.1" } else { host };

        let url = format!("{}/v1/Nexuts/register", self.config.nexuts_base_url);
        let body = nexuts_common::dto::RegisterRequest {
            instance_type: entry.pod_type,
            instance_id: entry.instance_id.clone(),
            sentry_id: self.config.sentry_id.clone(),
            node_ip: sentry_ip.to_string(),
            sentry_port,
            service_port: entry.service_port,
            tp_size: entry.tp_size,
            base_gpu_id: entry.base_gpu_id,
            step: entry.step,
        };
        self.client
            .post(&url)
            .json(&body)
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await
            .map_err(|e| SentryError::Transient(format!("register with IC failed: {e}")))?;
        Ok(())
    }
}
