//! IC HTTP surface (spec.md §6 "HTTP (IC)"), following
//! `knhk-sidecar::rest_api::SidecarRestApiServer::start`'s exact
//! listener/serve/log-endpoints pattern.

use crate::health;
use crate::router::{get_best_instance, RouterConfig};
use crate::IcState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nexuts_common::dto::{
    DeregisterRequest, ErrorBody, GetBestInstanceResponse, HealthResponse, RegisterRequest, ResultOk,
    SetStatusRequest, UpdatePrefixTreeRequest,
};
use nexuts_common::error::{Classified, Kind};
use nexuts_common::Token;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(state: Arc<IcState>) -> Router {
    Router::new()
        .route("/v1/Nexuts/register", post(register))
        .route("/v1/Nexuts/set_status", post(set_status))
        .route("/v1/Nexuts/deregister", post(deregister))
        .route("/v1/Nexuts/update_prefix_tree", post(update_prefix_tree))
        .route("/v1/Nexuts/health", get(health_check))
        .route("/v1/Nexuts/get_best_instance", get(get_best_instance_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start(state: Arc<IcState>) -> anyhow::Result<()> {
    let bind_address = state.config.bind_address.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Nexuts REST API listening on http://{bind_address}");
    tracing::info!("  POST /v1/Nexuts/register");
    tracing::info!("  POST /v1/Nexuts/set_status");
    tracing::info!("  POST /v1/Nexuts/deregister");
    tracing::info!("  POST /v1/Nexuts/update_prefix_tree");
    tracing::info!("  GET  /v1/Nexuts/health");
    tracing::info!("  GET  /v1/Nexuts/get_best_instance");
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

async fn register(State(state): State<Arc<IcState>>, Json(body): Json<RegisterRequest>) -> Response {
    if let Err(e) = state.register_sentry(&body.sentry_id, &body.node_ip, body.sentry_port) {
        return error_response(e.kind(), e.to_string());
    }
    if let Err(e) = state.register_worker(
        &body.instance_id,
        body.instance_type,
        &body.sentry_id,
        &body.node_ip,
        body.service_port,
        body.tp_size,
        body.base_gpu_id,
        body.step,
    ) {
        return error_response(e.kind(), e.to_string());
    }
    health::spawn_sentry_watcher(state, body.sentry_id);
    (StatusCode::OK, Json(ResultOk::default())).into_response()
}

async fn set_status(State(state): State<Arc<IcState>>, Json(body): Json<SetStatusRequest>) -> Response {
    let SetStatusRequest {
        sentry_id,
        instance_id,
        status,
    } = body;
    match state.set_status(&sentry_id, &instance_id, status) {
        Ok(()) => (StatusCode::OK, Json(ResultOk::default())).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()),
    }
}

async fn deregister(State(state): State<Arc<IcState>>, Json(body): Json<DeregisterRequest>) -> Response {
    match state.deregister_worker(&body.sentry_id, &body.instance_id) {
        Ok(()) => (StatusCode::OK, Json(ResultOk::default())).into_response(),
        Err(e) => error_response(e.kind(), e.to_string()),
    }
}

async fn update_prefix_tree(State(state): State<Arc<IcState>>, Json(body): Json<UpdatePrefixTreeRequest>) -> Response {
    // A per-request correlation id for the batch, the same
    // `uuid::Uuid::new_v4()`-per-transaction shape as
    // `knhk-sidecar::service::Sidecar::apply_transaction`'s telemetry tag.
    let batch_id = uuid::Uuid::new_v4();
    let UpdatePrefixTreeRequest {
        timestamp,
        sentry_ops_id,
        sentry_id,
        updates,
    } = body;
    let batch = nexuts_common::OpBatch {
        sentry_id,
        sentry_ops_id,
        timestamp,
        updates,
    };
    tracing::debug!(%batch_id, sentry_id = %batch.sentry_id, sentry_ops_id = batch.sentry_ops_id, ops = batch.updates.len(), "accepted update_prefix_tree batch");
    match state.accept_and_apply(batch).await {
        Ok(()) => (StatusCode::OK, Json(ResultOk::default())).into_response(),
        Err(e) => {
            tracing::warn!(%batch_id, error = %e, "update_prefix_tree batch failed");
            error_response(e.kind(), e.to_string())
        }
    }
}

async fn health_check() -> Response {
    (StatusCode::OK, Json(HealthResponse::default())).into_response()
}

/// `GET /v1/Nexuts/get_best_instance?prompt_tokens=100,200,300` (spec.md
/// §6): `prompt_tokens` is a comma-separated list of decimal token ids;
/// malformed input returns `{"error":"Invalid prompt_tokens format"}`.
async fn get_best_instance_handler(State(state): State<Arc<IcState>>, Query(params): Query<HashMap<String, String>>) -> Response {
    let prompt_tokens = match params.get("prompt_tokens") {
        None => None,
        Some(raw) if raw.is_empty() => Some(Vec::new()),
        Some(raw) => match parse_prompt_tokens(raw) {
            Ok(toks) => Some(toks),
            Err(()) => {
                return (StatusCode::BAD_REQUEST, Json(ErrorBody::new("Invalid prompt_tokens format"))).into_response();
            }
        },
    };

    let available = state.available_with_metrics();
    let config = RouterConfig {
        weights: (&state.config.load_balancing_weights).into(),
        balance_threshold: state.config.balance_threshold,
    };
    let decision = get_best_instance(&available, prompt_tokens.as_deref(), &state.tree, &config);

    let body = match decision {
        crate::router::RouteDecision::CacheAware { instance_id } => GetBestInstanceResponse::CacheAware {
            instance_id: instance_id.0,
        },
        crate::router::RouteDecision::LoadBalanced { instance_id } => GetBestInstanceResponse::LoadBalanced {
            instance_id: instance_id.0,
        },
        crate::router::RouteDecision::None { message } => GetBestInstanceResponse::None { message },
    };
    (StatusCode::OK, Json(body)).into_response()
}

fn parse_prompt_tokens(raw: &str) -> Result<Vec<Token>, ()> {
    raw.split(',')
        .map(|s| s.trim().parse::<u32>().map(Token).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_tokens() {
        let toks = parse_prompt_tokens("100,200,300").unwrap();
        assert_eq!(toks, vec![Token(100), Token(200), Token(300)]);
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(parse_prompt_tokens("100,abc,300").is_err());
    }
}
