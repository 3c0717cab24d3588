use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

/// A broadcaster's recorded scope grant for one (consumer, bot) pair.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GrantRow {
    pub id: Uuid,
    pub consumer_id: Uuid,
    pub bot_id: Uuid,
    pub broadcaster_user_id: String,
    pub broadcaster_login: String,
    pub scopes_csv: String,
    pub authorized_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GrantRow {
    pub fn scopes(&self) -> Vec<String> {
        self.scopes_csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

const COLUMNS: &str = "id, consumer_id, bot_id, broadcaster_user_id, broadcaster_login, \
     scopes_csv, authorized_at, updated_at";

/// Every grant any consumer holds for (bot, broadcaster); scope checks accept
/// the subscription when at least one row satisfies the requirement.
pub async fn list_for_bot_broadcaster(
    pool: &PgPool,
    bot_id: Uuid,
    broadcaster_user_id: &str,
) -> Result<Vec<GrantRow>, sqlx::Error> {
    sqlx::query_as::<_, GrantRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM broadcaster_grants \
         WHERE bot_id = $1 AND broadcaster_user_id = $2"
    )))
    .bind(bot_id)
    .bind(broadcaster_user_id)
    .fetch_all(pool)
    .await
}
