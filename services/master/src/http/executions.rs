use crate::coordinator::DispatchError;
use crate::http::response::{bad_request, internal_error, not_found};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

const DEFAULT_LIST_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub node_id: String,
    pub command: String,
}

pub async fn execute(State(state): State<AppState>, Json(body): Json<ExecuteBody>) -> Response {
    match state.coordinator.dispatch(&body.node_id, &body.command).await {
        Ok(exec_id) => {
            (StatusCode::OK, Json(serde_json::json!({ "exec_id": exec_id }))).into_response()
        }
        Err(DispatchError::NodeMissing(_)) => not_found("node not found"),
        Err(DispatchError::NodeOffline(_)) => bad_request("node is offline"),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecutionsQuery {
    pub node_id: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
    match state
        .coordinator
        .list_executions(query.node_id.as_deref(), limit)
        .await
    {
        Ok(executions) => (
            StatusCode::OK,
            Json(serde_json::json!({ "executions": executions })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn get_execution_logs(
    State(state): State<AppState>,
    Path(exec_id): Path<String>,
) -> Response {
    match state.coordinator.get_execution_logs(&exec_id).await {
        Ok(Some(lines)) => {
            (StatusCode::OK, Json(serde_json::json!({ "logs": lines }))).into_response()
        }
        Ok(None) => not_found("execution not found"),
        Err(e) => internal_error(e),
    }
}
