use sqlx::PgPool;
use std::collections::HashSet;
use uuid::Uuid;

/// Bot ids this consumer is restricted to. An empty set means the consumer
/// may use any enabled bot.
pub async fn allowed_bot_ids(
    pool: &PgPool,
    consumer_id: Uuid,
) -> Result<HashSet<Uuid>, sqlx::Error> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT bot_id FROM consumer_bot_access WHERE consumer_id = $1")
            .bind(consumer_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Whether `consumer_id` may act through `bot_id` under the current access
/// restrictions.
pub async fn consumer_can_access_bot(
    pool: &PgPool,
    consumer_id: Uuid,
    bot_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let allowed = allowed_bot_ids(pool, consumer_id).await?;
    Ok(allowed.is_empty() || allowed.contains(&bot_id))
}
