use crate::coordinator::Coordinator;
use crate::fanout::FanoutPlane;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Long-lived application values shared with every HTTP/WS handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub fanout: Arc<FanoutPlane>,
    pub coordinator: Arc<Coordinator>,
}
