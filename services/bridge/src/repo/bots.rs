use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BotRow {
    pub id: Uuid,
    pub name: String,
    pub twitch_user_id: String,
    pub twitch_login: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, name, twitch_user_id, twitch_login, access_token, refresh_token, \
     token_expires_at, enabled, created_at, updated_at";

pub async fn list_all(pool: &PgPool) -> Result<Vec<BotRow>, sqlx::Error> {
    sqlx::query_as::<_, BotRow>(sqlx::AssertSqlSafe(format!("SELECT {COLUMNS} FROM bots ORDER BY name")))
        .fetch_all(pool)
        .await
}

pub async fn list_enabled(pool: &PgPool) -> Result<Vec<BotRow>, sqlx::Error> {
    sqlx::query_as::<_, BotRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM bots WHERE enabled ORDER BY name"
    )))
    .fetch_all(pool)
    .await
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<BotRow>, sqlx::Error> {
    sqlx::query_as::<_, BotRow>(sqlx::AssertSqlSafe(format!("SELECT {COLUMNS} FROM bots WHERE id = $1")))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_by_twitch_user_id(
    pool: &PgPool,
    twitch_user_id: &str,
) -> Result<Option<BotRow>, sqlx::Error> {
    sqlx::query_as::<_, BotRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM bots WHERE twitch_user_id = $1"
    )))
    .bind(twitch_user_id)
    .fetch_optional(pool)
    .await
}

pub async fn update_tokens(
    pool: &PgPool,
    id: Uuid,
    access_token: &str,
    refresh_token: &str,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE bots SET access_token = $2, refresh_token = $3, token_expires_at = $4, \
         updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(access_token)
    .bind(refresh_token)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Authorization-revoke handling: the bot keeps its row but loses its tokens
/// and stops being schedulable.
pub async fn disable_and_clear_tokens(
    pool: &PgPool,
    twitch_user_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE bots SET enabled = FALSE, access_token = '', refresh_token = '', \
         updated_at = now() WHERE twitch_user_id = $1",
    )
    .bind(twitch_user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
