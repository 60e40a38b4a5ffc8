//! Sentry HTTP surface (spec.md §6 "HTTP (Sentry)"), following
//! `knhk-sidecar::rest_api::SidecarRestApiServer::start`'s exact
//! listener/serve/log-endpoints pattern.

use crate::{health, pipeline, SentryState, WorkerEntry};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nexuts_common::dto::{ErrorBody, HealthResponse, InstancesResponse, RadixTreeUpdateRequest, RegisterInferenceInfo, ResultOk};
use nexuts_common::error::{Classified, Kind};
use nexuts_common::WorkerId;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(state: Arc<SentryState>) -> Router {
    Router::new()
        .route("/v1/Sentry/register_inference_info", post(register_inference_info))
        .route("/v1/radixtree/update", post(radixtree_update))
        .route("/v1/health", get(health_check))
        .route("/v1/instances", get(instances))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start(state: Arc<SentryState>) -> anyhow::Result<()> {
    let bind_address = state.config.bind_address.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Sentry REST API listening on http://{bind_address}");
    tracing::info!("  POST /v1/Sentry/register_inference_info");
    tracing::info!("  POST /v1/radixtree/update");
    tracing::info!("  GET  /v1/health");
    tracing::info!("  GET  /v1/instances");
    axum::serve(listener, app).await?;
    Ok(())
}

fn error_response(kind: Kind, msg: String) -> Response {
    let status = match kind {
        Kind::Validation => StatusCode::BAD_REQUEST,
        Kind::NotFound => StatusCode::NOT_FOUND,
        Kind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        Kind::Corruption | Kind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody::new(msg))).into_response()
}

async fn register_inference_info(State(state): State<Arc<SentryState>>, Json(body): Json<RegisterInferenceInfo>) -> Response {
    let entry = WorkerEntry {
        instance_id: body.instance_id.clone(),
        pod_type: body.instance_type,
        node_ip: body.node_ip,
        service_port: body.service_port,
        tp_size: body.tp_size,
        base_gpu_id: body.base_gpu_id,
        step: body.step,
    };

    if let Err(e) = state.register_worker(entry.clone()) {
        return error_response(e.kind(), e.to_string());
    }
    if let Err(e) = state.register_with_ic(&entry).await {
        tracing::warn!(error = %e, instance_id = %entry.instance_id, "failed to announce new worker to IC");
    }
    health::spawn_worker_watcher(state.clone(), entry.instance_id);

    (StatusCode::OK, Json(ResultOk::default())).into_response()
}

async fn radixtree_update(State(state): State<Arc<SentryState>>, Json(body): Json<RadixTreeUpdateRequest>) -> Response {
    let RadixTreeUpdateRequest {
        instance_id, info, ..
    } = body;

    if !state.workers.contains_key(&instance_id) {
        return error_response(Kind::NotFound, format!("instance {instance_id} not registered"));
    }
    let worker = WorkerId::from(instance_id.clone());

    // Correlation id for this batch's log lines, the same per-request
    // `uuid::Uuid::new_v4()` tag `knhk-sidecar::service::Sidecar` stamps on
    // every transaction it applies.
    let batch_id = uuid::Uuid::new_v4();
    let op_count = info.len();
    let results = info.into_iter().map(|op| {
        let applied = state.tree.apply_op(&worker, &op).map_err(crate::error::SentryError::from);
        (op, applied)
    });
    let report = pipeline::record_and_buffer(&state.pipeline, &instance_id, results);
    tracing::debug!(%batch_id, instance_id = %instance_id, ops = op_count, all_ok = report.all_ok(), "applied radixtree/update batch");

    (StatusCode::OK, Json(report)).into_response()
}

async fn health_check() -> Response {
    (StatusCode::OK, Json(HealthResponse::default())).into_response()
}

async fn instances(State(state): State<Arc<SentryState>>) -> Response {
    (
        StatusCode::OK,
        Json(InstancesResponse {
            instances: state.instance_ids(),
        }),
    )
        .into_response()
}
