//! Bot user-token upkeep.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::repo::bots::{self, BotRow};
use crate::twitch::{TwitchClient, TwitchError};

/// Refresh this far ahead of expiry so in-flight requests never race the
/// token's end of life.
const REFRESH_SKEW_SECONDS: i64 = 120;

/// Return a usable access token for `bot`, refreshing and persisting the
/// rotated pair when the stored token is about to expire.
pub async fn ensure_bot_access_token(
    pool: &PgPool,
    twitch: &TwitchClient,
    bot: &BotRow,
) -> Result<String, TwitchError> {
    let deadline = Utc::now() + ChronoDuration::seconds(REFRESH_SKEW_SECONDS);
    if bot.token_expires_at > deadline && !bot.access_token.is_empty() {
        return Ok(bot.access_token.clone());
    }
    let refreshed = twitch.refresh_token(&bot.refresh_token).await?;
    if let Err(err) = bots::update_tokens(
        pool,
        bot.id,
        &refreshed.access_token,
        &refreshed.refresh_token,
        refreshed.expires_at,
    )
    .await
    {
        // The token still works for this call even if persisting it failed.
        debug!(bot_id = %bot.id, error = %err, "failed persisting refreshed bot token");
    }
    Ok(refreshed.access_token)
}
