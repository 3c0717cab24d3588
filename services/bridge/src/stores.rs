//! Ephemeral stores: upstream message dedupe and single-use downstream-WS
//! handshake tokens.
//!
//! Both sweep expired entries on access; neither performs I/O under its lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use tokio::time::Instant;
use uuid::Uuid;

/// Bounded-TTL set of upstream message ids. `is_new` answers true exactly
/// once per id within the TTL; empty ids are never new.
pub struct MessageDeduper {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl MessageDeduper {
    pub fn new(ttl: Duration) -> Self {
        MessageDeduper { ttl, seen: Mutex::new(HashMap::new()) }
    }

    pub fn is_new(&self, message_id: &str) -> bool {
        if message_id.is_empty() {
            return false;
        }
        let now = Instant::now();
        let mut seen = self.seen.lock().expect("deduper mutex poisoned");
        seen.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);
        if seen.contains_key(message_id) {
            return false;
        }
        seen.insert(message_id.to_owned(), now);
        true
    }
}

/// Single-use tokens for the downstream-WS handshake. Tokens are ≥256 bits
/// of CSPRNG output; `consume` removes the token atomically.
pub struct WsTokenStore {
    ttl: Duration,
    tokens: Mutex<HashMap<String, (Uuid, Instant)>>,
}

impl WsTokenStore {
    pub fn new(ttl: Duration) -> Self {
        WsTokenStore { ttl, tokens: Mutex::new(HashMap::new()) }
    }

    /// Mint a token for `consumer_id`; returns the token and its lifetime in
    /// whole seconds (what the HTTP response advertises).
    pub fn issue(&self, consumer_id: Uuid) -> (String, u64) {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        let now = Instant::now();
        let mut tokens = self.tokens.lock().expect("token store mutex poisoned");
        tokens.retain(|_, (_, issued)| now.duration_since(*issued) < self.ttl);
        tokens.insert(token.clone(), (consumer_id, now));
        (token, self.ttl.as_secs())
    }

    pub fn consume(&self, token: &str) -> Option<Uuid> {
        let now = Instant::now();
        let mut tokens = self.tokens.lock().expect("token store mutex poisoned");
        tokens.retain(|_, (_, issued)| now.duration_since(*issued) < self.ttl);
        let (consumer_id, issued) = tokens.remove(token)?;
        if now.duration_since(issued) >= self.ttl {
            return None;
        }
        Some(consumer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deduper_accepts_each_id_once_within_ttl() {
        let deduper = MessageDeduper::new(Duration::from_secs(600));
        assert!(deduper.is_new("m1"));
        assert!(!deduper.is_new("m1"));
        assert!(deduper.is_new("m2"));
    }

    #[tokio::test(start_paused = true)]
    async fn deduper_rejects_empty_ids() {
        let deduper = MessageDeduper::new(Duration::from_secs(600));
        assert!(!deduper.is_new(""));
        assert!(!deduper.is_new(""));
    }

    #[tokio::test(start_paused = true)]
    async fn deduper_forgets_ids_after_ttl() {
        let deduper = MessageDeduper::new(Duration::from_secs(600));
        assert!(deduper.is_new("m1"));
        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(deduper.is_new("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn ws_token_is_single_use() {
        let store = WsTokenStore::new(Duration::from_secs(60));
        let consumer = Uuid::new_v4();
        let (token, expires_in) = store.issue(consumer);
        assert_eq!(expires_in, 60);
        assert_eq!(store.consume(&token), Some(consumer));
        assert_eq!(store.consume(&token), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ws_token_expires() {
        let store = WsTokenStore::new(Duration::from_secs(60));
        let (token, _) = store.issue(Uuid::new_v4());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.consume(&token), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ws_tokens_are_long_and_distinct() {
        let store = WsTokenStore::new(Duration::from_secs(60));
        let (a, _) = store.issue(Uuid::new_v4());
        let (b, _) = store.issue(Uuid::new_v4());
        assert_ne!(a, b);
        // 32 bytes of entropy -> 43 chars of unpadded base64
        assert!(a.len() >= 43);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_token_is_a_miss() {
        let store = WsTokenStore::new(Duration::from_secs(60));
        assert_eq!(store.consume("nope"), None);
    }
}
