use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InterestRow {
    pub id: Uuid,
    pub consumer_id: Uuid,
    pub bot_id: Uuid,
    pub event_type: String,
    pub broadcaster_user_id: String,
    /// Downstream transport: `"websocket"` or `"webhook"`.
    pub transport: String,
    pub webhook_url: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub stale_marked_at: Option<DateTime<Utc>>,
    pub delete_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, consumer_id, bot_id, event_type, broadcaster_user_id, transport, \
     webhook_url, last_heartbeat_at, stale_marked_at, delete_after, created_at, updated_at";

pub async fn list_all(pool: &PgPool) -> Result<Vec<InterestRow>, sqlx::Error> {
    sqlx::query_as::<_, InterestRow>(sqlx::AssertSqlSafe(format!("SELECT {COLUMNS} FROM interests")))
        .fetch_all(pool)
        .await
}

pub async fn list_for_consumer(
    pool: &PgPool,
    consumer_id: Uuid,
) -> Result<Vec<InterestRow>, sqlx::Error> {
    sqlx::query_as::<_, InterestRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM interests WHERE consumer_id = $1 ORDER BY created_at"
    )))
    .bind(consumer_id)
    .fetch_all(pool)
    .await
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<InterestRow>, sqlx::Error> {
    sqlx::query_as::<_, InterestRow>(sqlx::AssertSqlSafe(format!("SELECT {COLUMNS} FROM interests WHERE id = $1")))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn find_exact(
    pool: &PgPool,
    consumer_id: Uuid,
    bot_id: Uuid,
    event_type: &str,
    broadcaster_user_id: &str,
    transport: &str,
    webhook_url: Option<&str>,
) -> Result<Option<InterestRow>, sqlx::Error> {
    sqlx::query_as::<_, InterestRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM interests \
         WHERE consumer_id = $1 AND bot_id = $2 AND event_type = $3 \
           AND broadcaster_user_id = $4 AND transport = $5 \
           AND webhook_url IS NOT DISTINCT FROM $6"
    )))
    .bind(consumer_id)
    .bind(bot_id)
    .bind(event_type)
    .bind(broadcaster_user_id)
    .bind(transport)
    .bind(webhook_url)
    .fetch_optional(pool)
    .await
}

pub async fn insert(
    pool: &PgPool,
    consumer_id: Uuid,
    bot_id: Uuid,
    event_type: &str,
    broadcaster_user_id: &str,
    transport: &str,
    webhook_url: Option<&str>,
) -> Result<InterestRow, sqlx::Error> {
    sqlx::query_as::<_, InterestRow>(sqlx::AssertSqlSafe(format!(
        "INSERT INTO interests \
         (id, consumer_id, bot_id, event_type, broadcaster_user_id, transport, webhook_url, \
          last_heartbeat_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, now()) RETURNING {COLUMNS}"
    )))
    .bind(Uuid::new_v4())
    .bind(consumer_id)
    .bind(bot_id)
    .bind(event_type)
    .bind(broadcaster_user_id)
    .bind(transport)
    .bind(webhook_url)
    .fetch_one(pool)
    .await
}

/// Refresh the heartbeat and clear stale marks on one interest's sibling set:
/// every interest the same consumer holds for the same (bot, broadcaster).
pub async fn touch_related(
    pool: &PgPool,
    consumer_id: Uuid,
    bot_id: Uuid,
    broadcaster_user_id: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE interests SET updated_at = now(), last_heartbeat_at = now(), \
         stale_marked_at = NULL, delete_after = NULL \
         WHERE consumer_id = $1 AND bot_id = $2 AND broadcaster_user_id = $3",
    )
    .bind(consumer_id)
    .bind(bot_id)
    .bind(broadcaster_user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn touch_all_for_consumer(pool: &PgPool, consumer_id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE interests SET updated_at = now(), last_heartbeat_at = now(), \
         stale_marked_at = NULL, delete_after = NULL WHERE consumer_id = $1",
    )
    .bind(consumer_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn clear_stale_marks(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE interests SET stale_marked_at = NULL, delete_after = NULL WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_stale_marks(
    pool: &PgPool,
    id: Uuid,
    stale_marked_at: DateTime<Utc>,
    delete_after: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE interests SET stale_marked_at = $2, delete_after = $3 WHERE id = $1",
    )
    .bind(id)
    .bind(stale_marked_at)
    .bind(delete_after)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM interests WHERE id = $1").bind(id).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_by_ids(pool: &PgPool, ids: &[Uuid]) -> Result<u64, sqlx::Error> {
    if ids.is_empty() {
        return Ok(0);
    }
    let result = sqlx::query("DELETE FROM interests WHERE id = ANY($1)")
        .bind(ids)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Move a consumer's rows recorded under a pre-normalization broadcaster
/// token over to the resolved id. Rows that would collide with an existing
/// row under the new id are dropped instead of renamed.
pub async fn merge_legacy_broadcaster(
    pool: &PgPool,
    consumer_id: Uuid,
    bot_id: Uuid,
    legacy_broadcaster: &str,
    broadcaster_user_id: &str,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM interests l \
         WHERE l.consumer_id = $1 AND l.bot_id = $2 AND l.broadcaster_user_id = $3 \
           AND EXISTS (SELECT 1 FROM interests d \
                       WHERE d.consumer_id = l.consumer_id AND d.bot_id = l.bot_id \
                         AND d.event_type = l.event_type AND d.broadcaster_user_id = $4 \
                         AND d.transport = l.transport \
                         AND d.webhook_url IS NOT DISTINCT FROM l.webhook_url)",
    )
    .bind(consumer_id)
    .bind(bot_id)
    .bind(legacy_broadcaster)
    .bind(broadcaster_user_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE interests SET broadcaster_user_id = $4, updated_at = now() \
         WHERE consumer_id = $1 AND bot_id = $2 AND broadcaster_user_id = $3",
    )
    .bind(consumer_id)
    .bind(bot_id)
    .bind(legacy_broadcaster)
    .bind(broadcaster_user_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}
