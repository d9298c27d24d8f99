use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

/// A registered edge machine.  `node_id` is immutable once assigned; only
/// the coordinator (and the liveness sweeper) write these rows.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct NodeRow {
    pub node_id: String,
    pub node_name: String,
    pub ip: String,
    pub status: String,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

const COLUMNS: &str =
    "node_id, node_name, ip, status, cpu_percent, mem_percent, last_heartbeat, registered_at";

pub async fn insert(
    pool: &SqlitePool,
    node_id: &str,
    node_name: &str,
    ip: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO nodes (node_id, node_name, ip, status, cpu_percent, mem_percent, last_heartbeat, registered_at)
         VALUES (?, ?, ?, 'online', 0, 0, ?, ?)",
    )
    .bind(node_id)
    .bind(node_name)
    .bind(ip)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_by_id(pool: &SqlitePool, node_id: &str) -> Result<Option<NodeRow>, sqlx::Error> {
    sqlx::query_as::<_, NodeRow>(&format!("SELECT {COLUMNS} FROM nodes WHERE node_id = ?"))
        .bind(node_id)
        .fetch_optional(pool)
        .await
}

pub async fn get_by_name(pool: &SqlitePool, node_name: &str) -> Result<Option<NodeRow>, sqlx::Error> {
    sqlx::query_as::<_, NodeRow>(&format!("SELECT {COLUMNS} FROM nodes WHERE node_name = ?"))
        .bind(node_name)
        .fetch_optional(pool)
        .await
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<NodeRow>, sqlx::Error> {
    sqlx::query_as::<_, NodeRow>(&format!(
        "SELECT {COLUMNS} FROM nodes ORDER BY registered_at ASC"
    ))
    .fetch_all(pool)
    .await
}

/// Re-registration of a known name: refresh IP and liveness, keep identity.
pub async fn mark_online(
    pool: &SqlitePool,
    node_id: &str,
    ip: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET status = 'online', ip = ?, last_heartbeat = ? WHERE node_id = ?")
        .bind(ip)
        .bind(now)
        .bind(node_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Last-writer-wins heartbeat ingest.  Returns false when the node id is
/// unknown.
pub async fn apply_heartbeat(
    pool: &SqlitePool,
    node_id: &str,
    status: &str,
    cpu_percent: f64,
    mem_percent: f64,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE nodes SET status = ?, cpu_percent = ?, mem_percent = ?, last_heartbeat = ?
         WHERE node_id = ?",
    )
    .bind(status)
    .bind(cpu_percent)
    .bind(mem_percent)
    .bind(now)
    .bind(node_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_status(pool: &SqlitePool, node_id: &str, status: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE nodes SET status = ? WHERE node_id = ?")
        .bind(status)
        .bind(node_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark every node whose last heartbeat predates `cutoff` offline; returns
/// the affected node ids so the caller can broadcast the transitions.
pub async fn sweep_stale(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "UPDATE nodes SET status = 'offline'
         WHERE status != 'offline' AND last_heartbeat < ?
         RETURNING node_id",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

/// Startup recovery: no agent can be live before its first heartbeat.
pub async fn mark_all_offline(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE nodes SET status = 'offline' WHERE status != 'offline'")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
