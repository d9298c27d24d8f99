use crate::http::response::{internal_error, not_found};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

pub async fn list_nodes(State(state): State<AppState>) -> Response {
    match state.coordinator.list_nodes().await {
        Ok(nodes) => (StatusCode::OK, Json(serde_json::json!({ "nodes": nodes }))).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn get_node(State(state): State<AppState>, Path(node_id): Path<String>) -> Response {
    match state.coordinator.get_node(&node_id).await {
        Ok(Some(node)) => (StatusCode::OK, Json(node)).into_response(),
        Ok(None) => not_found("node not found"),
        Err(e) => internal_error(e),
    }
}
