//! Connection password checks.
//!
//! The configured password is kept only as a SHA-256 digest and client
//! attempts are compared digest to digest.

use sha2::{Digest, Sha256};

/// Validates PASS attempts against a configured password.
#[derive(Debug, Clone)]
pub struct PasswordValidator {
    /// SHA-256 hex digest of the password.
    hash: String,
}

impl PasswordValidator {
    /// Creates a validator for a plaintext password.
    pub fn new(password: &str) -> Self {
        Self {
            hash: Self::hash_password(password),
        }
    }

    /// Creates a validator from a precomputed digest.
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into().to_ascii_lowercase(),
        }
    }

    /// Validates a plaintext attempt by hashing and comparing.
    pub fn validate(&self, attempt: &str) -> bool {
        Self::hash_password(attempt) == self.hash
    }

    /// Hashes a password using SHA-256, returning a lowercase hex string.
    pub fn hash_password(password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hex::encode(hasher.finalize())
    }
}
