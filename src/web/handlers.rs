//! HTTP request handlers.

use super::AppState;
use crate::incident::{IncidentState, StoreError};

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Deserialize;

const DEFAULT_RESULTS_LIMIT: i64 = 100;
const MAX_RESULTS_LIMIT: i64 = 5000;

pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.sink.encode() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Persisted incident state. A state file that does not exist yet reads as empty.
pub async fn handle_incidents(State(state): State<AppState>) -> impl IntoResponse {
    match state.incidents.read() {
        Ok(incidents) => Json(incidents).into_response(),
        Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Json(IncidentState::default()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub network: Option<String>,
    pub limit: Option<i64>,
}

pub async fn handle_results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_RESULTS_LIMIT)
        .min(MAX_RESULTS_LIMIT);
    let network = query.network.as_deref().filter(|n| !n.is_empty());

    match state.store.get_recent_results(network, limit) {
        Ok(results) => Json(results).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_healthz() -> &'static str {
    "ok"
}
