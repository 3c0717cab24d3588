use sqlx::PgPool;
use uuid::Uuid;

/// Append one delivery trace. Callers treat failures as best-effort: traces
/// must never block or fail the delivery path, so errors only reach the log.
pub async fn record(
    pool: &PgPool,
    consumer_id: Uuid,
    direction: &str,
    local_transport: &str,
    event_type: &str,
    target: Option<&str>,
    payload_json: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO event_traces \
         (id, consumer_id, direction, local_transport, event_type, target, payload_json) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(Uuid::new_v4())
    .bind(consumer_id)
    .bind(direction)
    .bind(local_transport)
    .bind(event_type)
    .bind(target)
    .bind(payload_json)
    .execute(pool)
    .await?;
    Ok(())
}
