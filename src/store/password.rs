//! Password hashing
//!
//! Argon2id via the password-hash API. Verification is constant-time by
//! construction.

use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;

use super::StoreError;

/// Hash a plaintext password into a PHC string.
pub fn hash_password(plain: &str) -> Result<String, StoreError> {
    if plain.is_empty() {
        return Err(StoreError::EmptyPassword);
    }

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| StoreError::Hash(e.to_string()))
}

/// Verify a plaintext password against a stored PHC string.
pub fn verify_password(stored_hash: &str, plain: &str) -> bool {
    if stored_hash.is_empty() || plain.is_empty() {
        return false;
    }

    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };

    Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok()
}
