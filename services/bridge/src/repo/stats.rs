use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StatsRow {
    pub consumer_id: Uuid,
    pub is_connected: bool,
    pub active_ws_connections: i64,
    pub total_ws_connects: i64,
    pub total_api_requests: i64,
    pub total_events_sent_ws: i64,
    pub total_events_sent_webhook: i64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub last_api_request_at: Option<DateTime<Utc>>,
    pub last_event_sent_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "consumer_id, is_connected, active_ws_connections, total_ws_connects, \
     total_api_requests, total_events_sent_ws, total_events_sent_webhook, last_connected_at, \
     last_disconnected_at, last_api_request_at, last_event_sent_at, updated_at";

pub async fn map_all(pool: &PgPool) -> Result<HashMap<Uuid, StatsRow>, sqlx::Error> {
    let rows = sqlx::query_as::<_, StatsRow>(sqlx::AssertSqlSafe(format!("SELECT {COLUMNS} FROM consumer_stats")))
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|row| (row.consumer_id, row)).collect())
}

/// (total active downstream-WS connections, latest disconnect timestamp)
/// across all consumers — the inputs of the upstream-WS cooldown heuristic.
pub async fn ws_activity(pool: &PgPool) -> Result<(i64, Option<DateTime<Utc>>), sqlx::Error> {
    let row: (i64, Option<DateTime<Utc>>) = sqlx::query_as(
        "SELECT COALESCE(SUM(active_ws_connections), 0)::BIGINT, MAX(last_disconnected_at) \
         FROM consumer_stats",
    )
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn record_connect(pool: &PgPool, consumer_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO consumer_stats \
         (consumer_id, is_connected, active_ws_connections, total_ws_connects, last_connected_at) \
         VALUES ($1, TRUE, 1, 1, now()) \
         ON CONFLICT (consumer_id) DO UPDATE SET \
           is_connected = TRUE, \
           active_ws_connections = consumer_stats.active_ws_connections + 1, \
           total_ws_connects = consumer_stats.total_ws_connects + 1, \
           last_connected_at = now(), \
           updated_at = now()",
    )
    .bind(consumer_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_disconnect(pool: &PgPool, consumer_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE consumer_stats SET \
           active_ws_connections = GREATEST(active_ws_connections - 1, 0), \
           is_connected = (GREATEST(active_ws_connections - 1, 0) > 0), \
           last_disconnected_at = now(), \
           updated_at = now() \
         WHERE consumer_id = $1",
    )
    .bind(consumer_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_ws_event(pool: &PgPool, consumer_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO consumer_stats (consumer_id, total_events_sent_ws, last_event_sent_at) \
         VALUES ($1, 1, now()) \
         ON CONFLICT (consumer_id) DO UPDATE SET \
           total_events_sent_ws = consumer_stats.total_events_sent_ws + 1, \
           last_event_sent_at = now(), \
           updated_at = now()",
    )
    .bind(consumer_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_webhook_event(pool: &PgPool, consumer_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO consumer_stats (consumer_id, total_events_sent_webhook, last_event_sent_at) \
         VALUES ($1, 1, now()) \
         ON CONFLICT (consumer_id) DO UPDATE SET \
           total_events_sent_webhook = consumer_stats.total_events_sent_webhook + 1, \
           last_event_sent_at = now(), \
           updated_at = now()",
    )
    .bind(consumer_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_api_request(pool: &PgPool, consumer_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO consumer_stats (consumer_id, total_api_requests, last_api_request_at) \
         VALUES ($1, 1, now()) \
         ON CONFLICT (consumer_id) DO UPDATE SET \
           total_api_requests = consumer_stats.total_api_requests + 1, \
           last_api_request_at = now(), \
           updated_at = now()",
    )
    .bind(consumer_id)
    .execute(pool)
    .await?;
    Ok(())
}
