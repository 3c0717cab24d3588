use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChannelStateRow {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub broadcaster_user_id: String,
    pub is_live: bool,
    pub title: Option<String>,
    pub game_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_checked_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, bot_id, broadcaster_user_id, is_live, title, game_name, started_at, \
     last_event_at, last_checked_at, created_at, updated_at";

pub async fn get(
    pool: &PgPool,
    bot_id: Uuid,
    broadcaster_user_id: &str,
) -> Result<Option<ChannelStateRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelStateRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM channel_states WHERE bot_id = $1 AND broadcaster_user_id = $2"
    )))
    .bind(bot_id)
    .bind(broadcaster_user_id)
    .fetch_optional(pool)
    .await
}

/// Liveness transition driven by a `stream.online` / `stream.offline` event.
pub async fn apply_stream_event(
    pool: &PgPool,
    bot_id: Uuid,
    broadcaster_user_id: &str,
    is_live: bool,
    started_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channel_states \
         (id, bot_id, broadcaster_user_id, is_live, started_at, last_event_at, last_checked_at) \
         VALUES ($1, $2, $3, $4, $5, now(), now()) \
         ON CONFLICT (bot_id, broadcaster_user_id) DO UPDATE SET \
           is_live = EXCLUDED.is_live, \
           started_at = EXCLUDED.started_at, \
           last_event_at = now(), \
           last_checked_at = now(), \
           updated_at = now()",
    )
    .bind(Uuid::new_v4())
    .bind(bot_id)
    .bind(broadcaster_user_id)
    .bind(is_live)
    .bind(started_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Full refresh from a Helix streams poll. `live` carries (title, game_name,
/// started_at) when the channel is live; `None` marks it offline.
pub async fn apply_helix_poll(
    pool: &PgPool,
    bot_id: Uuid,
    broadcaster_user_id: &str,
    live: Option<(Option<String>, Option<String>, Option<DateTime<Utc>>)>,
) -> Result<(), sqlx::Error> {
    let (is_live, title, game_name, started_at) = match live {
        Some((title, game_name, started_at)) => (true, title, game_name, started_at),
        None => (false, None, None, None),
    };
    sqlx::query(
        "INSERT INTO channel_states \
         (id, bot_id, broadcaster_user_id, is_live, title, game_name, started_at, last_checked_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, now()) \
         ON CONFLICT (bot_id, broadcaster_user_id) DO UPDATE SET \
           is_live = EXCLUDED.is_live, \
           title = EXCLUDED.title, \
           game_name = EXCLUDED.game_name, \
           started_at = EXCLUDED.started_at, \
           last_checked_at = now(), \
           updated_at = now()",
    )
    .bind(Uuid::new_v4())
    .bind(bot_id)
    .bind(broadcaster_user_id)
    .bind(is_live)
    .bind(title)
    .bind(game_name)
    .bind(started_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(
    pool: &PgPool,
    bot_id: Uuid,
    broadcaster_user_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM channel_states WHERE bot_id = $1 AND broadcaster_user_id = $2",
    )
    .bind(bot_id)
    .bind(broadcaster_user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Companion to the interest legacy-broadcaster merge.
pub async fn merge_legacy_broadcaster(
    pool: &PgPool,
    bot_id: Uuid,
    legacy_broadcaster: &str,
    broadcaster_user_id: &str,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM channel_states l \
         WHERE l.bot_id = $1 AND l.broadcaster_user_id = $2 \
           AND EXISTS (SELECT 1 FROM channel_states d \
                       WHERE d.bot_id = l.bot_id AND d.broadcaster_user_id = $3)",
    )
    .bind(bot_id)
    .bind(legacy_broadcaster)
    .bind(broadcaster_user_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE channel_states SET broadcaster_user_id = $3, updated_at = now() \
         WHERE bot_id = $1 AND broadcaster_user_id = $2",
    )
    .bind(bot_id)
    .bind(legacy_broadcaster)
    .bind(broadcaster_user_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await
}
