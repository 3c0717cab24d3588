//! Credential handling for the two caller classes: operators (admin key) and
//! consumers (client id + secret). Secrets are stored as SHA-256 digests;
//! the plaintext leaves the process exactly once, in the create/regenerate
//! response.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::repo::consumers::{self, ConsumerRow};

pub fn generate_client_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn generate_client_secret() -> String {
    let mut bytes = [0u8; 48];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

pub fn verify_secret(secret: &str, secret_hash: &str) -> bool {
    // Compare digests, not plaintext, so length never leaks.
    let candidate = Sha256::digest(secret.as_bytes());
    let Ok(stored) = hex::decode(secret_hash) else {
        return false;
    };
    if stored.len() != candidate.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in candidate.iter().zip(stored.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[derive(Debug)]
pub enum AuthFailure {
    BadCredentials,
    Store(sqlx::Error),
}

/// Resolve a consumer from its API credentials. Disabled consumers fail the
/// same way unknown ones do.
pub async fn authenticate_consumer(
    pool: &PgPool,
    client_id: &str,
    client_secret: &str,
) -> Result<ConsumerRow, AuthFailure> {
    if client_id.is_empty() || client_secret.is_empty() {
        return Err(AuthFailure::BadCredentials);
    }
    let consumer = consumers::get_by_client_id(pool, client_id)
        .await
        .map_err(AuthFailure::Store)?
        .filter(|c| c.enabled)
        .ok_or(AuthFailure::BadCredentials)?;
    if !verify_secret(client_secret, &consumer.client_secret_hash) {
        return Err(AuthFailure::BadCredentials);
    }
    Ok(consumer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_round_trips() {
        let secret = generate_client_secret();
        let hash = hash_secret(&secret);
        assert!(verify_secret(&secret, &hash));
        assert!(!verify_secret("wrong", &hash));
    }

    #[test]
    fn malformed_stored_hash_never_verifies() {
        assert!(!verify_secret("anything", "zz-not-hex"));
        assert!(!verify_secret("anything", "abcd"));
    }

    #[test]
    fn client_ids_are_hex_uuids() {
        let id = generate_client_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn secrets_are_long_and_distinct() {
        let a = generate_client_secret();
        let b = generate_client_secret();
        assert_ne!(a, b);
        assert!(a.len() >= 64);
    }
}
