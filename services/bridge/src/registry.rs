//! In-memory interest index.
//!
//! Rebuilt from the store at startup and kept in lockstep with it by the API
//! handlers and the GC. One mutex serializes every operation; callers get
//! snapshot copies, never references into the maps.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use uuid::Uuid;

use crate::repo::interests::InterestRow;

/// The tuple a single upstream subscription is keyed by. Many interests from
/// many consumers can share one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterestKey {
    pub bot_id: Uuid,
    pub event_type: String,
    pub broadcaster_user_id: String,
}

impl InterestKey {
    pub fn of(interest: &InterestRow) -> InterestKey {
        InterestKey {
            bot_id: interest.bot_id,
            event_type: interest.event_type.clone(),
            broadcaster_user_id: interest.broadcaster_user_id.clone(),
        }
    }
}

impl std::fmt::Display for InterestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.bot_id, self.event_type, self.broadcaster_user_id)
    }
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<Uuid, InterestRow>,
    by_key: HashMap<InterestKey, HashSet<Uuid>>,
}

#[derive(Default)]
pub struct InterestRegistry {
    inner: Mutex<Inner>,
}

impl InterestRegistry {
    pub fn new() -> Self {
        InterestRegistry::default()
    }

    /// Atomically replace the contents with a fresh load from the store.
    pub fn load(&self, interests: Vec<InterestRow>) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_id.clear();
        inner.by_key.clear();
        for interest in interests {
            let key = InterestKey::of(&interest);
            inner.by_key.entry(key).or_default().insert(interest.id);
            inner.by_id.insert(interest.id, interest);
        }
    }

    /// Idempotent on interest id.
    pub fn add(&self, interest: &InterestRow) -> InterestKey {
        let key = InterestKey::of(interest);
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_key.entry(key.clone()).or_default().insert(interest.id);
        inner.by_id.insert(interest.id, interest.clone());
        key
    }

    /// Returns the key and whether other interests still reference it.
    pub fn remove(&self, interest: &InterestRow) -> (InterestKey, bool) {
        let key = InterestKey::of(interest);
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_id.remove(&interest.id);
        if let Some(ids) = inner.by_key.get_mut(&key) {
            ids.remove(&interest.id);
            if ids.is_empty() {
                inner.by_key.remove(&key);
            }
        }
        let still_used = inner.by_key.contains_key(&key);
        (key, still_used)
    }

    pub fn keys(&self) -> Vec<InterestKey> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_key.keys().cloned().collect()
    }

    pub fn has_key(&self, key: &InterestKey) -> bool {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_key.contains_key(key)
    }

    /// Snapshot of the interests currently registered under `key`.
    pub fn interested(&self, key: &InterestKey) -> Vec<InterestRow> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner
            .by_key
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| inner.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn interest(bot_id: Uuid, event_type: &str, broadcaster: &str) -> InterestRow {
        InterestRow {
            id: Uuid::new_v4(),
            consumer_id: Uuid::new_v4(),
            bot_id,
            event_type: event_type.to_owned(),
            broadcaster_user_id: broadcaster.to_owned(),
            transport: "websocket".to_owned(),
            webhook_url: None,
            last_heartbeat_at: Some(Utc::now()),
            stale_marked_at: None,
            delete_after: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn add_then_remove_restores_the_previous_view() {
        let registry = InterestRegistry::new();
        let bot = Uuid::new_v4();
        let first = interest(bot, "stream.online", "222");
        let key = registry.add(&first);
        let before: Vec<Uuid> = registry.interested(&key).iter().map(|i| i.id).collect();

        let second = interest(bot, "stream.online", "222");
        registry.add(&second);
        let (removed_key, still_used) = registry.remove(&second);
        assert_eq!(removed_key, key);
        assert!(still_used);

        let after: Vec<Uuid> = registry.interested(&key).iter().map(|i| i.id).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn every_listed_key_has_interested_rows() {
        let registry = InterestRegistry::new();
        let bot = Uuid::new_v4();
        registry.add(&interest(bot, "stream.online", "222"));
        registry.add(&interest(bot, "channel.follow", "222"));
        for key in registry.keys() {
            assert!(!registry.interested(&key).is_empty());
        }
    }

    #[test]
    fn removing_the_last_interest_drops_the_key() {
        let registry = InterestRegistry::new();
        let row = interest(Uuid::new_v4(), "stream.online", "222");
        let key = registry.add(&row);
        let (_, still_used) = registry.remove(&row);
        assert!(!still_used);
        assert!(!registry.has_key(&key));
        assert!(registry.keys().is_empty());
        assert!(registry.interested(&key).is_empty());
    }

    #[test]
    fn add_is_idempotent_on_interest_id() {
        let registry = InterestRegistry::new();
        let row = interest(Uuid::new_v4(), "stream.online", "222");
        registry.add(&row);
        registry.add(&row);
        let key = InterestKey::of(&row);
        assert_eq!(registry.interested(&key).len(), 1);
    }

    #[test]
    fn load_replaces_contents_atomically() {
        let registry = InterestRegistry::new();
        registry.add(&interest(Uuid::new_v4(), "stream.online", "222"));

        let replacement = interest(Uuid::new_v4(), "channel.cheer", "333");
        let key = InterestKey::of(&replacement);
        registry.load(vec![replacement]);

        assert_eq!(registry.keys().len(), 1);
        assert!(registry.has_key(&key));
    }

    #[test]
    fn interests_with_distinct_transports_share_one_key() {
        let registry = InterestRegistry::new();
        let bot = Uuid::new_v4();
        let mut ws = interest(bot, "stream.online", "222");
        ws.transport = "websocket".to_owned();
        let mut hook = interest(bot, "stream.online", "222");
        hook.transport = "webhook".to_owned();
        hook.webhook_url = Some("https://svc.example.com/hook".to_owned());

        let key = registry.add(&ws);
        registry.add(&hook);
        assert_eq!(registry.interested(&key).len(), 2);
        assert_eq!(registry.keys().len(), 1);
    }
}
