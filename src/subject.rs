//! Key to subject mapping.
//!
//! Application keys are never written to the broker as-is. Each key is hashed
//! with SHA-256 and the lowercase hex digest is appended to a subject prefix.
//! Key `hello` under prefix `users`:
//!
//! ```text
//! users.2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824
//! ```
//!
//! The hash is part of the persisted layout. Changing it orphans every value
//! already stored.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Maximum prefix length in bytes.
pub const MAX_PREFIX_LENGTH: usize = 256;

/// Map `key` to its subject under `prefix`.
pub fn to_subject(prefix: &str, key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{}.{}", prefix, hex::encode(digest))
}

/// Validate that a prefix is a usable broker subject.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(Error::InvalidPrefix("prefix cannot be empty".to_string()));
    }
    if prefix.len() > MAX_PREFIX_LENGTH {
        return Err(Error::InvalidPrefix(format!(
            "prefix exceeds maximum length of {} bytes",
            MAX_PREFIX_LENGTH
        )));
    }
    for token in prefix.split('.') {
        if token.is_empty() {
            return Err(Error::InvalidPrefix(format!(
                "{:?} contains an empty token",
                prefix
            )));
        }
        if token.contains(['*', '>']) {
            return Err(Error::InvalidPrefix(format!(
                "{:?} contains a wildcard",
                prefix
            )));
        }
        if token.chars().any(char::is_whitespace) {
            return Err(Error::InvalidPrefix(format!(
                "{:?} contains whitespace",
                prefix
            )));
        }
    }
    Ok(())
}

/// A validated prefix that maps keys to subjects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    /// Create a codec, rejecting prefixes that are not valid subjects.
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self { prefix })
    }

    /// Prefix every subject starts with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Subject for `key`.
    pub fn subject(&self, key: &str) -> String {
        to_subject(&self.prefix, key)
    }
}
