use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConsumerRow {
    pub id: Uuid,
    pub name: String,
    pub client_id: String,
    pub client_secret_hash: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, name, client_id, client_secret_hash, enabled, created_at, updated_at";

pub async fn list_all(pool: &PgPool) -> Result<Vec<ConsumerRow>, sqlx::Error> {
    sqlx::query_as::<_, ConsumerRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM consumers ORDER BY created_at"
    )))
    .fetch_all(pool)
    .await
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<ConsumerRow>, sqlx::Error> {
    sqlx::query_as::<_, ConsumerRow>(sqlx::AssertSqlSafe(format!("SELECT {COLUMNS} FROM consumers WHERE id = $1")))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_by_client_id(
    pool: &PgPool,
    client_id: &str,
) -> Result<Option<ConsumerRow>, sqlx::Error> {
    sqlx::query_as::<_, ConsumerRow>(sqlx::AssertSqlSafe(format!(
        "SELECT {COLUMNS} FROM consumers WHERE client_id = $1"
    )))
    .bind(client_id)
    .fetch_optional(pool)
    .await
}

pub async fn insert(
    pool: &PgPool,
    name: &str,
    client_id: &str,
    client_secret_hash: &str,
) -> Result<ConsumerRow, sqlx::Error> {
    sqlx::query_as::<_, ConsumerRow>(sqlx::AssertSqlSafe(format!(
        "INSERT INTO consumers (id, name, client_id, client_secret_hash) \
         VALUES ($1, $2, $3, $4) RETURNING {COLUMNS}"
    )))
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(client_id)
    .bind(client_secret_hash)
    .fetch_one(pool)
    .await
}

pub async fn set_secret_hash(
    pool: &PgPool,
    client_id: &str,
    client_secret_hash: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE consumers SET client_secret_hash = $2, updated_at = now() WHERE client_id = $1",
    )
    .bind(client_id)
    .bind(client_secret_hash)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Of the given consumer ids, the subset that is currently enabled.
/// Disabled consumers are invisible to fan-out.
pub async fn enabled_ids(pool: &PgPool, ids: &[Uuid]) -> Result<HashSet<Uuid>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT id FROM consumers WHERE id = ANY($1) AND enabled")
            .bind(ids)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
