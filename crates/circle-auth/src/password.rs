use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use rand::Rng;
use rand::distr::Alphanumeric;
use rand_core::OsRng;
use tracing::warn;

use crate::error::AuthError;

const ACTIVATION_CODE_LEN: usize = 32;

/// Hash a password with Argon2id and a fresh salt.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hashing(e.to_string()))
}

/// `false` for a wrong password and for an unparseable stored hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Stored password hash is unparseable: {}", e);
            return false;
        }
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// URL-safe random code mailed to new accounts.
pub fn generate_activation_code() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ACTIVATION_CODE_LEN)
        .map(char::from)
        .collect()
}
