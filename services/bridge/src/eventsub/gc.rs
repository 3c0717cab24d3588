//! Stale-interest garbage collection.
//!
//! Every `gc_interval` each interest is scored against three liveness
//! signals; interests failing all three are marked stale and, after the
//! long grace period, deleted together with the upstream subscription they
//! were the last user of.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use super::EventSubManager;
use crate::config::Tunables;
use crate::repo;
use crate::repo::interests::InterestRow;
use crate::repo::stats::StatsRow;

/// What the GC should do with one interest this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleAction {
    /// At least one liveness signal is present; clear any stale marks.
    Fresh,
    /// No liveness signal; (re)record the stale window.
    Mark { stale_marked_at: DateTime<Utc>, delete_after: DateTime<Utc> },
    /// The stale window has fully elapsed.
    Delete,
}

fn chrono_dur(dur: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(dur).unwrap_or_else(|_| ChronoDuration::zero())
}

/// Score one interest. Liveness is any of: an open downstream-WS for the
/// consumer, a disconnect within the grace window, or a fresh heartbeat.
pub fn classify_interest(
    now: DateTime<Utc>,
    interest: &InterestRow,
    stats: Option<&StatsRow>,
    tunables: &Tunables,
) -> StaleAction {
    let active_ws = stats.is_some_and(|s| s.active_ws_connections > 0);
    let disconnect_in_grace = stats
        .and_then(|s| s.last_disconnected_at)
        .is_some_and(|at| now - at <= chrono_dur(tunables.interest_disconnect_grace));
    let heartbeat_at =
        interest.last_heartbeat_at.unwrap_or(interest.updated_at.max(interest.created_at));
    let heartbeat_fresh = now - heartbeat_at <= chrono_dur(tunables.interest_heartbeat_timeout);

    if active_ws || disconnect_in_grace || heartbeat_fresh {
        return StaleAction::Fresh;
    }
    let stale_marked_at = interest.stale_marked_at.unwrap_or(now);
    let delete_after = interest
        .delete_after
        .unwrap_or(stale_marked_at + chrono_dur(tunables.interest_unsubscribe_after_stale));
    if now >= delete_after {
        StaleAction::Delete
    } else {
        StaleAction::Mark { stale_marked_at, delete_after }
    }
}

impl EventSubManager {
    pub(crate) async fn run_gc_loop(self: Arc<Self>) {
        loop {
            if self.stopped() {
                return;
            }
            match self.prune_stale_interests().await {
                Ok(removed) if removed > 0 => info!(removed, "pruned stale interests"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "stale interest cleanup failed"),
            }
            tokio::time::sleep(self.settings.tunables.gc_interval).await;
        }
    }

    /// One GC pass; returns how many interests were deleted.
    pub async fn prune_stale_interests(&self) -> Result<usize, sqlx::Error> {
        let now = Utc::now();
        let interests = repo::interests::list_all(&self.pool).await?;
        let stats = repo::stats::map_all(&self.pool).await?;
        let mut doomed: Vec<InterestRow> = Vec::new();

        for interest in interests {
            match classify_interest(
                now,
                &interest,
                stats.get(&interest.consumer_id),
                &self.settings.tunables,
            ) {
                StaleAction::Fresh => {
                    if interest.stale_marked_at.is_some() || interest.delete_after.is_some() {
                        repo::interests::clear_stale_marks(&self.pool, interest.id).await?;
                    }
                }
                StaleAction::Mark { stale_marked_at, delete_after } => {
                    if interest.stale_marked_at != Some(stale_marked_at)
                        || interest.delete_after != Some(delete_after)
                    {
                        repo::interests::set_stale_marks(
                            &self.pool,
                            interest.id,
                            stale_marked_at,
                            delete_after,
                        )
                        .await?;
                    }
                }
                StaleAction::Delete => doomed.push(interest),
            }
        }

        let removed = doomed.len();
        for interest in doomed {
            repo::interests::delete(&self.pool, interest.id).await?;
            info!(
                consumer_id = %interest.consumer_id,
                interest_id = %interest.id,
                event_type = %interest.event_type,
                broadcaster = %interest.broadcaster_user_id,
                "unsubscribing stale interest after extended inactivity"
            );
            let (key, still_used) = self.registry.remove(&interest);
            self.on_interest_removed(&key, still_used).await;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tunables() -> Tunables {
        Tunables::default()
    }

    fn interest(heartbeat_ago_secs: i64, now: DateTime<Utc>) -> InterestRow {
        InterestRow {
            id: Uuid::new_v4(),
            consumer_id: Uuid::new_v4(),
            bot_id: Uuid::new_v4(),
            event_type: "stream.online".to_owned(),
            broadcaster_user_id: "222".to_owned(),
            transport: "websocket".to_owned(),
            webhook_url: None,
            last_heartbeat_at: Some(now - ChronoDuration::seconds(heartbeat_ago_secs)),
            stale_marked_at: None,
            delete_after: None,
            created_at: now - ChronoDuration::days(7),
            updated_at: now - ChronoDuration::days(7),
        }
    }

    fn stats(consumer_id: Uuid, active: i64, disconnected_ago: Option<i64>, now: DateTime<Utc>) -> StatsRow {
        StatsRow {
            consumer_id,
            is_connected: active > 0,
            active_ws_connections: active,
            total_ws_connects: 1,
            total_api_requests: 0,
            total_events_sent_ws: 0,
            total_events_sent_webhook: 0,
            last_connected_at: None,
            last_disconnected_at: disconnected_ago.map(|secs| now - ChronoDuration::seconds(secs)),
            last_api_request_at: None,
            last_event_sent_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn fresh_heartbeat_keeps_the_interest() {
        let now = Utc::now();
        let row = interest(60, now);
        assert_eq!(classify_interest(now, &row, None, &tunables()), StaleAction::Fresh);
    }

    #[test]
    fn active_ws_connection_keeps_a_heartbeatless_interest() {
        let now = Utc::now();
        let row = interest(10 * 3600, now);
        let s = stats(row.consumer_id, 1, None, now);
        assert_eq!(classify_interest(now, &row, Some(&s), &tunables()), StaleAction::Fresh);
    }

    #[test]
    fn recent_disconnect_grants_grace() {
        let now = Utc::now();
        let row = interest(10 * 3600, now);
        let s = stats(row.consumer_id, 0, Some(5 * 60), now);
        assert_eq!(classify_interest(now, &row, Some(&s), &tunables()), StaleAction::Fresh);
    }

    #[test]
    fn expired_heartbeat_marks_the_interest_stale() {
        let now = Utc::now();
        // 30 min timeout + 1 s
        let row = interest(30 * 60 + 1, now);
        match classify_interest(now, &row, None, &tunables()) {
            StaleAction::Mark { stale_marked_at, delete_after } => {
                assert_eq!(stale_marked_at, now);
                assert_eq!(delete_after, now + ChronoDuration::hours(24));
            }
            other => panic!("expected mark, got {other:?}"),
        }
    }

    #[test]
    fn existing_marks_are_preserved_not_reset() {
        let now = Utc::now();
        let mut row = interest(10 * 3600, now);
        let marked = now - ChronoDuration::hours(2);
        row.stale_marked_at = Some(marked);
        row.delete_after = Some(marked + ChronoDuration::hours(24));
        match classify_interest(now, &row, None, &tunables()) {
            StaleAction::Mark { stale_marked_at, delete_after } => {
                assert_eq!(stale_marked_at, marked);
                assert_eq!(delete_after, marked + ChronoDuration::hours(24));
            }
            other => panic!("expected mark, got {other:?}"),
        }
    }

    #[test]
    fn elapsed_delete_window_deletes() {
        let now = Utc::now();
        let mut row = interest(100 * 3600, now);
        row.stale_marked_at = Some(now - ChronoDuration::hours(25));
        row.delete_after = Some(now - ChronoDuration::seconds(1));
        assert_eq!(classify_interest(now, &row, None, &tunables()), StaleAction::Delete);
    }

    #[test]
    fn heartbeat_falls_back_to_updated_at() {
        let now = Utc::now();
        let mut row = interest(0, now);
        row.last_heartbeat_at = None;
        row.updated_at = now - ChronoDuration::minutes(5);
        assert_eq!(classify_interest(now, &row, None, &tunables()), StaleAction::Fresh);
        row.updated_at = now - ChronoDuration::hours(2);
        row.created_at = now - ChronoDuration::days(3);
        assert!(matches!(classify_interest(now, &row, None, &tunables()), StaleAction::Mark { .. }));
    }
}
