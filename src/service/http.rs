//! HTTP skin
//!
//! Read endpoints, admin commands and health. Every endpoint except health
//! and status runs behind the leader-forwarding layer: on a non-leader
//! instance the request is proxied verbatim to the leader's HTTP address.

use crate::common::Error;
use crate::server::Coordinator;
use crate::service::forward::ForwardClient;
use crate::storage::types::ShardId;
use axum::extract::{Path, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct HttpState {
    pub coordinator: Arc<Coordinator>,
    pub forward: Arc<ForwardClient>,
}

pub fn create_router(coordinator: Arc<Coordinator>, forward: Arc<ForwardClient>) -> Router {
    let state = HttpState {
        coordinator,
        forward,
    };
    let forwarded = Router::new()
        .route("/route/:schema/:table", get(route_table))
        .route("/v1/cluster-view", get(cluster_view))
        .route("/v1/schemas", post(create_schema))
        .route("/admin/transfer-leader", post(transfer_leader))
        .route("/admin/split-shard", post(split_shard))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            forward_to_leader,
        ));
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .merge(forwarded)
        .with_state(state)
}

async fn forward_to_leader(State(state): State<HttpState>, req: Request, next: Next) -> Response {
    if state.coordinator.member().is_leader() {
        return next.run(req).await;
    }
    match state.forward.forward(req).await {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

fn error_response(e: Error) -> Response {
    (e.to_http_status(), Json(json!({ "error": e.to_string() }))).into_response()
}

async fn health(State(state): State<HttpState>) -> impl IntoResponse {
    let member = state.coordinator.member();
    Json(json!({
        "status": "healthy",
        "node": member.node_id(),
        "is_leader": member.is_leader(),
    }))
}

async fn status(State(state): State<HttpState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let member = coordinator.member();
    let cluster = coordinator.cluster();
    let registry = coordinator.registry();
    let counters = coordinator.engine().counters();
    let online = registry.snapshot_online(Instant::now()).len();
    let known = registry.snapshot_all().len();
    Json(json!({
        "node": member.node_id(),
        "is_leader": member.is_leader(),
        "leader_endpoint": member.leader_endpoint(),
        "cache_loaded": cluster.is_loaded(),
        "generation": cluster.generation(),
        "nodes_online": online,
        "nodes_known": known,
        "procedures": {
            "finished": counters.finished,
            "failed": counters.failed,
            "cancelled": counters.cancelled,
        },
    }))
}

async fn route_table(
    State(state): State<HttpState>,
    Path((schema, table)): Path<(String, String)>,
) -> Response {
    match state.coordinator.route(&schema, &table) {
        Ok((route, endpoint)) => Json(json!({
            "schema": schema,
            "table": table,
            "table_id": route.table.id.0,
            "shard_id": route.shard_id.0,
            "leader_node": route.leader_node,
            "endpoint": endpoint,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn cluster_view(State(state): State<HttpState>) -> Response {
    match state.coordinator.get_cluster_view() {
        Ok(view) => Json(view).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct CreateSchemaBody {
    name: String,
}

async fn create_schema(
    State(state): State<HttpState>,
    Json(body): Json<CreateSchemaBody>,
) -> Response {
    match state.coordinator.create_schema(&body.name) {
        Ok(schema) => Json(json!({ "schema_id": schema.id.0, "name": schema.name })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct TransferLeaderBody {
    shard_id: u32,
    target_node: String,
}

async fn transfer_leader(
    State(state): State<HttpState>,
    Json(body): Json<TransferLeaderBody>,
) -> Response {
    match state
        .coordinator
        .transfer_leader(ShardId(body.shard_id), &body.target_node)
        .await
    {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct SplitShardBody {
    source_shard_id: u32,
    target_shard_id: u32,
}

async fn split_shard(State(state): State<HttpState>, Json(body): Json<SplitShardBody>) -> Response {
    match state
        .coordinator
        .split_shard(ShardId(body.source_shard_id), ShardId(body.target_shard_id))
        .await
    {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(e),
    }
}
