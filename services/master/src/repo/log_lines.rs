use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

/// One persisted line of subprocess output.  Append-only; `id` preserves
/// ingest arrival order within equal timestamps.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LogLineRow {
    pub id: i64,
    pub exec_id: String,
    pub stream: String,
    pub line: String,
    pub timestamp: f64,
}

pub async fn insert(
    pool: &SqlitePool,
    exec_id: &str,
    stream: &str,
    line: &str,
    timestamp: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO log_lines (exec_id, stream, line, timestamp) VALUES (?, ?, ?, ?)")
        .bind(exec_id)
        .bind(stream)
        .bind(line)
        .bind(timestamp)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_for_execution(
    pool: &SqlitePool,
    exec_id: &str,
) -> Result<Vec<LogLineRow>, sqlx::Error> {
    sqlx::query_as::<_, LogLineRow>(
        "SELECT id, exec_id, stream, line, timestamp FROM log_lines
         WHERE exec_id = ? ORDER BY timestamp ASC, id ASC",
    )
    .bind(exec_id)
    .fetch_all(pool)
    .await
}
