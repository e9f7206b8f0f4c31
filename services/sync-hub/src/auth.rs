//! Admission & Auth Glue (C9), token half: `authenticate(token) -> user_id`.
//!
//! Grounded directly in the teacher's `validate_token`/`TokenClaims`, down
//! to hashing the bearer token with SHA-256 before the lookup so the raw
//! token never touches storage or logs. The teacher resolves a
//! `(device_id, device_type)` pair for its own forwarder/receiver split;
//! this resolves the single `user_id` spec §4.9 calls for, since device
//! identity here is the client-supplied `Hello.device_id`, not an
//! authentication credential.

use sha2::{Digest, Sha256};
use sqlx::PgPool;

pub async fn authenticate(pool: &PgPool, raw_token: &str) -> Option<String> {
    let hash = Sha256::digest(raw_token.as_bytes());
    let row = sqlx::query(
        "SELECT user_id FROM auth_tokens WHERE token_hash = $1 AND revoked_at IS NULL",
    )
    .bind(hash.as_slice())
    .fetch_optional(pool)
    .await
    .ok()??;
    Some(sqlx::Row::get(&row, "user_id"))
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_accepts_only_the_bearer_scheme() {
        assert_eq!(extract_bearer("Bearer abc123"), Some("abc123"));
        assert_eq!(extract_bearer("Basic abc123"), None);
        assert_eq!(extract_bearer(""), None);
    }
}
