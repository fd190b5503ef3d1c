//! # Admin API
//!
//! Local JSON endpoints for inspecting and (in unmanaged mode) editing the
//! agent's routes:
//! - `GET  /api/status` — connection status report
//! - `GET  /api/routes` — current route set
//! - `POST /api/routes` — upsert one route, persist, re-publish
//! - `DELETE /api/routes/{hostname}` — remove one route, persist, re-publish
//!
//! In managed mode the mutating endpoints answer 403: the route set belongs
//! to the control plane. This is an operational contract, not a security
//! boundary; the listener binds to loopback by default.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tunnel_proto::Route;

use crate::state::{AgentService, Status};

pub fn router(service: Arc<AgentService>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/routes", get(list_routes).post(upsert_route))
        // The matcher never binds an empty segment, so the bare
        // trailing-slash form needs its own route to answer 400.
        .route("/api/routes/", delete(delete_route_missing))
        .route("/api/routes/{hostname}", delete(delete_route))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

#[derive(Deserialize)]
struct RoutePayload {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    target: String,
}

#[derive(Serialize)]
struct RoutesBody {
    routes: Vec<Route>,
}

#[derive(Serialize)]
struct MutationResult {
    ok: bool,
    sync_ok: bool,
    routes: Vec<Route>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn get_status(State(service): State<Arc<AgentService>>) -> Json<Status> {
    Json(service.status().await)
}

async fn list_routes(State(service): State<Arc<AgentService>>) -> Json<RoutesBody> {
    Json(RoutesBody {
        routes: service.store().list(),
    })
}

/// The body arrives as raw bytes so the managed check runs before any
/// decoding: managed mode answers 403 even for malformed input.
async fn upsert_route(State(service): State<Arc<AgentService>>, body: Bytes) -> Response {
    if service.managed() {
        return managed_refusal();
    }
    let payload: RoutePayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid json".to_string()),
    };
    if let Err(err) = service.store().upsert(&payload.hostname, &payload.target) {
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }
    mutation_response(&service).await
}

async fn delete_route(
    State(service): State<Arc<AgentService>>,
    Path(hostname): Path<String>,
) -> Response {
    if service.managed() {
        return managed_refusal();
    }
    if let Err(err) = service.store().delete(&hostname) {
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }
    mutation_response(&service).await
}

/// `DELETE /api/routes/` with no hostname segment.
async fn delete_route_missing(State(service): State<Arc<AgentService>>) -> Response {
    if service.managed() {
        return managed_refusal();
    }
    error_response(StatusCode::BAD_REQUEST, "hostname is required".to_string())
}

/// Shared tail of both mutations: re-publish to the gateway and report
/// whether that worked alongside the updated route list.
async fn mutation_response(service: &AgentService) -> Response {
    let sync_result = service.publish_routes().await;
    Json(MutationResult {
        ok: true,
        sync_ok: sync_result.is_ok(),
        routes: service.store().list(),
        warning: sync_result.err().map(|err| err.to_string()),
    })
    .into_response()
}

fn managed_refusal() -> Response {
    error_response(
        StatusCode::FORBIDDEN,
        "routes are managed by control plane".to_string(),
    )
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(ErrorBody { error: message })).into_response()
}
