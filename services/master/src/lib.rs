pub mod config;
pub mod coordinator;
pub mod db;
pub mod events;
pub mod fanout;
pub mod http;
pub mod id;
pub mod repo;
pub mod state;
pub mod sweeper;
pub mod ws;

pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/api/nodes", get(http::nodes::list_nodes))
        .route("/api/nodes/:node_id", get(http::nodes::get_node))
        .route("/api/execute", post(http::executions::execute))
        .route("/api/executions", get(http::executions::list_executions))
        .route(
            "/api/executions/:exec_id/logs",
            get(http::executions::get_execution_logs),
        )
        .route("/ws/logs/:node_id", get(ws::ws_logs_handler))
        .route("/ws/global", get(ws::ws_global_handler))
        .layer(TraceLayer::new_for_http())
        // Operator UIs are served from elsewhere during development.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
}
