//! One-way password hashing capability.
//!
//! The command pipeline hands handlers a [`PasswordHashing`] implementation
//! instead of a concrete algorithm. The production implementation is
//! Argon2id in PHC string format; plaintext passwords are never stored and
//! never logged.

use argon2::{
    Argon2, PasswordHasher as _, PasswordVerifier as _,
    password_hash::{PasswordHash, SaltString, rand_core::OsRng},
};
use thiserror::Error;

/// Error produced by a hashing backend.
///
/// The message never contains the password being hashed.
#[derive(Debug, Error)]
#[error("password hashing failed: {0}")]
pub struct HashError(pub String);

/// One-way password hashing.
///
/// `hash` produces a self-describing hash string; `verify` checks a
/// plaintext candidate against a previously produced hash.
pub trait PasswordHashing: Send + Sync {
    /// Hash a plaintext password.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if the backend fails to produce a hash.
    fn hash(&self, password: &str) -> Result<String, HashError>;

    /// Verify a plaintext password against a stored hash.
    ///
    /// Returns `Ok(false)` on a well-formed hash that does not match.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] if the stored hash is malformed.
    fn verify(&self, password: &str, hash: &str) -> Result<bool, HashError>;
}

/// Argon2id hashing with default parameters and a per-hash random salt.
#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2Hashing;

impl PasswordHashing for Argon2Hashing {
    fn hash(&self, password: &str) -> Result<String, HashError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| HashError(e.to_string()))
    }

    fn verify(&self, password: &str, hash: &str) -> Result<bool, HashError> {
        let parsed =
            PasswordHash::new(hash).map_err(|e| HashError(format!("invalid hash format: {e}")))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(HashError(format!("verify error: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_not_the_password() {
        let hash = Argon2Hashing.hash("hunter2").unwrap();
        assert_ne!(hash, "hunter2");
        assert!(hash.starts_with("$argon2"));
    }

    #[test]
    fn correct_password_verifies() {
        let hash = Argon2Hashing.hash("hunter2").unwrap();
        assert!(Argon2Hashing.verify("hunter2", &hash).unwrap());
    }

    #[test]
    fn wrong_password_does_not_verify() {
        let hash = Argon2Hashing.hash("hunter2").unwrap();
        assert!(!Argon2Hashing.verify("wrong", &hash).unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error() {
        let result = Argon2Hashing.verify("hunter2", "not-a-phc-string");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid hash format"));
    }
}
