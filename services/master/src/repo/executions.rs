use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

/// One command invocation on one node.  Created `running`; the terminal
/// state is written exactly once.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ExecutionRow {
    pub exec_id: String,
    pub node_id: String,
    pub command: String,
    pub status: String,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

const COLUMNS: &str = "exec_id, node_id, command, status, exit_code, created_at, finished_at";

pub async fn insert(
    pool: &SqlitePool,
    exec_id: &str,
    node_id: &str,
    command: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO executions (exec_id, node_id, command, status, created_at)
         VALUES (?, ?, ?, 'running', ?)",
    )
    .bind(exec_id)
    .bind(node_id)
    .bind(command)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, exec_id: &str) -> Result<Option<ExecutionRow>, sqlx::Error> {
    sqlx::query_as::<_, ExecutionRow>(&format!(
        "SELECT {COLUMNS} FROM executions WHERE exec_id = ?"
    ))
    .bind(exec_id)
    .fetch_optional(pool)
    .await
}

pub async fn list(
    pool: &SqlitePool,
    node_id: Option<&str>,
    limit: i64,
) -> Result<Vec<ExecutionRow>, sqlx::Error> {
    match node_id {
        Some(node_id) => {
            sqlx::query_as::<_, ExecutionRow>(&format!(
                "SELECT {COLUMNS} FROM executions WHERE node_id = ?
                 ORDER BY created_at DESC LIMIT ?"
            ))
            .bind(node_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, ExecutionRow>(&format!(
                "SELECT {COLUMNS} FROM executions ORDER BY created_at DESC LIMIT ?"
            ))
            .bind(limit)
            .fetch_all(pool)
            .await
        }
    }
}

/// Write the terminal state.  The `status = 'running'` guard makes a
/// duplicate `cmd_done` a no-op; returns false in that case.
pub async fn finish(
    pool: &SqlitePool,
    exec_id: &str,
    status: &str,
    exit_code: i32,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE executions SET status = ?, exit_code = ?, finished_at = ?
         WHERE exec_id = ? AND status = 'running'",
    )
    .bind(status)
    .bind(exit_code)
    .bind(now)
    .bind(exec_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Fail every running execution on a node that just went offline; returns
/// the affected exec ids so completion events can be pushed to viewers.
pub async fn fail_running_for_node(
    pool: &SqlitePool,
    node_id: &str,
    exit_code: i32,
    now: DateTime<Utc>,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "UPDATE executions SET status = 'failed', exit_code = ?, finished_at = ?
         WHERE node_id = ? AND status = 'running'
         RETURNING exec_id",
    )
    .bind(exit_code)
    .bind(now)
    .bind(node_id)
    .fetch_all(pool)
    .await
}

/// Startup recovery: executions left `running` by an unclean shutdown can
/// never complete.
pub async fn fail_all_running(
    pool: &SqlitePool,
    exit_code: i32,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE executions SET status = 'failed', exit_code = ?, finished_at = ?
         WHERE status = 'running'",
    )
    .bind(exit_code)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
