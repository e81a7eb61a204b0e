use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use router_core::{Dispatcher, RouterError, WorkerId, WorkerRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::transport::ReqwestTransport;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<WorkerRegistry>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/workers", get(list_workers).post(add_worker))
        .route("/workers/:id", axum::routing::delete(remove_worker))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn generate(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match state.dispatcher.dispatch(body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => router_error_response(&err),
    }
}

#[derive(Deserialize)]
struct AddWorkerRequest {
    id: String,
    address: String,
}

#[derive(Serialize)]
struct WorkerSummary {
    id: String,
    address: String,
    in_flight: u64,
    live_sequences: u64,
}

async fn add_worker(
    State(state): State<AppState>,
    Json(req): Json<AddWorkerRequest>,
) -> Response {
    match state.registry.add(WorkerId::from(req.id), req.address) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err) => router_error_response(&err),
    }
}

async fn remove_worker(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    state.registry.remove(&WorkerId::from(id));
    StatusCode::NO_CONTENT.into_response()
}

async fn list_workers(State(state): State<AppState>) -> Response {
    let summaries: Vec<WorkerSummary> = state
        .registry
        .workers_in_order()
        .into_iter()
        .map(|w| WorkerSummary {
            id: w.id.to_string(),
            address: w.address.clone(),
            in_flight: w.in_flight.load(Ordering::SeqCst),
            live_sequences: w.tree.lock().expect("lock poisoned").len(),
        })
        .collect();
    Json(summaries).into_response()
}

fn router_error_response(err: &RouterError) -> Response {
    let (status, message) = match err {
        RouterError::AlreadyExists(_) => (StatusCode::CONFLICT, err.to_string()),
        RouterError::InvalidPolicy { .. } => (StatusCode::BAD_REQUEST, err.to_string()),
        RouterError::NoWorkersAvailable => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        RouterError::TransportFailure { .. } => (StatusCode::BAD_GATEWAY, err.to_string()),
        RouterError::MalformedResponse { .. } => (StatusCode::BAD_GATEWAY, err.to_string()),
        RouterError::Tree(_) => {
            tracing::error!(%err, "radix tree invariant violated");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
        }
    };
    (status, Json(json!({ "error": message }))).into_response()
}

pub fn build_transport(address: &str) -> Arc<dyn router_core::WorkerTransport> {
    match ReqwestTransport::new(address) {
        Ok(transport) => Arc::new(transport),
        Err(err) => {
            // reqwest::Client::builder().build() only fails on TLS backend
            // initialization issues, not on bad addresses; treat it as a
            // startup-time configuration error.
            panic!("failed to build HTTP client for worker {address}: {err}")
        }
    }
}
