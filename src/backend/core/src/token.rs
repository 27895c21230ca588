//! Resume token generation.
//!
//! A resume token is the single-slot optimistic-concurrency checkpoint for a
//! submission: exactly one value is valid at any instant, every successful
//! mutation rotates it, and a caller presenting a stale value loses the race.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a fresh, unguessable resume token.
///
/// Random v4 UUID material digested through SHA-256 and hex-encoded, so
/// tokens are uniform 64-char strings with no structure a client could
/// predict or increment.
pub fn generate_resume_token() -> String {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tokens_are_unique_and_fixed_length() {
        let tokens: HashSet<String> = (0..100).map(|_| generate_resume_token()).collect();
        assert_eq!(tokens.len(), 100);
        assert!(tokens.iter().all(|t| t.len() == 64));
        assert!(tokens
            .iter()
            .all(|t| t.chars().all(|c| c.is_ascii_hexdigit())));
    }
}
