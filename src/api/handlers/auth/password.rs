//! Argon2id password hashing and verification.

use anyhow::Result;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use rand::rngs::OsRng;

/// Hash a password with Argon2id and a fresh salt.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| anyhow::anyhow!("failed to hash password"))?
        .to_string();
    Ok(hash)
}

/// Verify a password against a stored Argon2id hash.
///
/// An unparseable stored hash verifies as `false` rather than erroring, so a
/// corrupt row cannot be distinguished from a wrong password by the caller.
#[must_use]
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{hash_password, verify_password};

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("Aa1!aaaa").unwrap();
        assert!(verify_password("Aa1!aaaa", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn hashes_are_salted() {
        let first = hash_password("Aa1!aaaa").unwrap();
        let second = hash_password("Aa1!aaaa").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn invalid_stored_hash_fails_closed() {
        assert!(!verify_password("Aa1!aaaa", "not-a-phc-string"));
    }
}
