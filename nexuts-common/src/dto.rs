//! Request/response bodies for the HTTP surfaces of spec.md §6, shared
//! between `nexuts-ic::api` and `nexuts-sentry::api` (and their respective
//! HTTP clients) so the wire shape is defined exactly once.

use crate::ops::{PendingUpdate, RadixOp};
use crate::types::{PodType, SlotId, Token, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `POST /v1/Nexuts/register`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub instance_type: PodType,
    pub instance_id: String,
    pub sentry_id: String,
    pub node_ip: String,
    pub sentry_port: u16,
    pub service_port: u16,
    #[serde(default = "default_tp_size")]
    pub tp_size: u32,
    #[serde(default)]
    pub base_gpu_id: u32,
    #[serde(default = "default_step")]
    pub step: u32,
}

fn default_tp_size() -> u32 {
    1
}

fn default_step() -> u32 {
    1
}

/// `POST /v1/Nexuts/set_status` — `status: true` means lost, `false` means
/// recovered (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusRequest {
    pub sentry_id: String,
    pub instance_id: String,
    pub status: bool,
}

/// `POST /v1/Nexuts/deregister`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub sentry_id: String,
    pub instance_id: String,
}

/// `POST /v1/Nexuts/update_prefix_tree`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePrefixTreeRequest {
    pub timestamp: String,
    pub sentry_ops_id: u64,
    pub sentry_id: String,
    pub updates: Vec<PendingUpdate>,
}

/// `GET /v1/Nexuts/get_best_instance?prompt_tokens=...` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "routing_strategy", rename_all = "snake_case")]
pub enum GetBestInstanceResponse {
    CacheAware { instance_id: String },
    LoadBalanced { instance_id: String },
    None { message: String },
}

/// Generic `{"result": "ok"}` success body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultOk {
    pub result: String,
}

impl Default for ResultOk {
    fn default() -> Self {
        Self {
            result: "ok".to_string(),
        }
    }
}

/// Generic `{"error": "..."}` body for the one documented 400 case
/// (malformed `prompt_tokens`) and other validation failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

/// `GET /v1/Nexuts/health`, `GET /v1/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// `POST /v1/Sentry/register_inference_info` — worker self-registration,
/// forwarded by the Sentry to the IC as a [`RegisterRequest`] after it
/// stamps in `sentry_id`/`sentry_port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterInferenceInfo {
    pub instance_type: PodType,
    pub instance_id: String,
    pub node_ip: String,
    pub service_port: u16,
    #[serde(default = "default_tp_size")]
    pub tp_size: u32,
    #[serde(default)]
    pub base_gpu_id: u32,
    #[serde(default = "default_step")]
    pub step: u32,
}

/// `POST /v1/radixtree/update` — radix op batch pushed by a worker to its
/// local Sentry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadixTreeUpdateRequest {
    pub ops_id: u64,
    pub timestamp: String,
    pub node_ip: String,
    pub server_port: u16,
    pub instance_id: String,
    pub info: Vec<RadixOp>,
}

/// `GET /v1/instances` response: worker ids currently tracked by a Sentry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancesResponse {
    pub instances: Vec<String>,
}

/// One node of the worker's radix tree as serialized by `GET
/// /v1/radixtree/full`, mirroring the dict shape
/// `original_source/Sentry/KvCacheIndex/radix_tree.py::_build_tree_from_dict`
/// walks (`key`/`value`/`children`, children linked by each child's own
/// first edge token).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RadixTreeNodeDto {
    #[serde(default)]
    pub edge_key: Vec<Token>,
    #[serde(default)]
    pub value: HashMap<WorkerId, Vec<SlotId>>,
    #[serde(default)]
    pub children: Vec<RadixTreeNodeDto>,
}

/// `GET /v1/radixtree/full` response consumed by a restarting prefill
/// worker's Sentry to reseed its local tree (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadixTreeFullResponse {
    pub tree: RadixTreeNodeDto,
    pub ops_id_finished: u64,
}
