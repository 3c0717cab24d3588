use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::registry::InterestKey;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub event_type: String,
    pub broadcaster_user_id: String,
    pub twitch_subscription_id: String,
    pub status: String,
    pub session_id: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, bot_id, event_type, broadcaster_user_id, twitch_subscription_id, \
     status, session_id, last_seen_at, created_at, updated_at";

pub async fn list_all(pool: &PgPool) -> Result<Vec<SubscriptionRow>, sqlx::Error> {
    sqlx::query_as::<_, SubscriptionRow>(sqlx::AssertSqlSafe(format!("SELECT {COLUMNS} FROM subscriptions")))
        .fetch_all(pool)
        .await
}

pub async fn list_stream_state(pool: &PgPool) -> Result<Vec<SubscriptionRow>, sqlx::Error> {
    sqlx::query_as::<_, SubscriptionRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM subscriptions WHERE event_type IN ('stream.online', 'stream.offline')"
    )))
    .fetch_all(pool)
    .await
}

pub async fn get_by_key(
    pool: &PgPool,
    key: &InterestKey,
) -> Result<Option<SubscriptionRow>, sqlx::Error> {
    sqlx::query_as::<_, SubscriptionRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM subscriptions \
         WHERE bot_id = $1 AND event_type = $2 AND broadcaster_user_id = $3"
    )))
    .bind(key.bot_id)
    .bind(&key.event_type)
    .bind(&key.broadcaster_user_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_by_twitch_id(
    pool: &PgPool,
    twitch_subscription_id: &str,
) -> Result<Option<SubscriptionRow>, sqlx::Error> {
    sqlx::query_as::<_, SubscriptionRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM subscriptions WHERE twitch_subscription_id = $1"
    )))
    .bind(twitch_subscription_id)
    .fetch_optional(pool)
    .await
}

/// twitch_subscription_id -> bot_id, used to keep ownership stable across a
/// reconcile truncation.
pub async fn prior_owners(pool: &PgPool) -> Result<Vec<(String, Uuid)>, sqlx::Error> {
    sqlx::query_as("SELECT twitch_subscription_id, bot_id FROM subscriptions")
        .fetch_all(pool)
        .await
}

pub async fn delete_all(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM subscriptions").execute(pool).await?;
    Ok(())
}

pub async fn delete_by_key(pool: &PgPool, key: &InterestKey) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM subscriptions \
         WHERE bot_id = $1 AND event_type = $2 AND broadcaster_user_id = $3",
    )
    .bind(key.bot_id)
    .bind(&key.event_type)
    .bind(&key.broadcaster_user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn insert(
    pool: &PgPool,
    bot_id: Uuid,
    event_type: &str,
    broadcaster_user_id: &str,
    twitch_subscription_id: &str,
    status: &str,
    session_id: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO subscriptions \
         (id, bot_id, event_type, broadcaster_user_id, twitch_subscription_id, status, \
          session_id, last_seen_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, now())",
    )
    .bind(Uuid::new_v4())
    .bind(bot_id)
    .bind(event_type)
    .bind(broadcaster_user_id)
    .bind(twitch_subscription_id)
    .bind(status)
    .bind(session_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace whatever row exists for the key with the freshly created upstream
/// subscription.
pub async fn upsert_for_key(
    pool: &PgPool,
    key: &InterestKey,
    twitch_subscription_id: &str,
    status: &str,
    session_id: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO subscriptions \
         (id, bot_id, event_type, broadcaster_user_id, twitch_subscription_id, status, \
          session_id, last_seen_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, now()) \
         ON CONFLICT (bot_id, event_type, broadcaster_user_id) DO UPDATE SET \
           twitch_subscription_id = EXCLUDED.twitch_subscription_id, \
           status = EXCLUDED.status, \
           session_id = EXCLUDED.session_id, \
           last_seen_at = now(), \
           updated_at = now()",
    )
    .bind(Uuid::new_v4())
    .bind(key.bot_id)
    .bind(&key.event_type)
    .bind(&key.broadcaster_user_id)
    .bind(twitch_subscription_id)
    .bind(status)
    .bind(session_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_revoked(
    pool: &PgPool,
    twitch_subscription_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE subscriptions SET status = 'revoked', updated_at = now() \
         WHERE twitch_subscription_id = $1",
    )
    .bind(twitch_subscription_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
