//! One-way digests for client identifiers and request content.

use std::fmt;

const DERIVE_CONTEXT: &str = "cdnarchive 2024-01-01 client identifier";

/// Irreversibly hashes raw client identifiers.
///
/// Digests are keyed by a key derived from the configured salt, so the same
/// identifier maps to the same value in every run sharing that salt.
#[derive(Clone)]
pub struct Anonymizer {
    key: [u8; 32],
}

impl Anonymizer {
    pub fn new(salt: &str) -> Self {
        Self {
            key: blake3::derive_key(DERIVE_CONTEXT, salt.as_bytes()),
        }
    }

    /// Hex digest of `client_id`; the raw value never leaves this call.
    pub fn client_digest(&self, client_id: &str) -> String {
        blake3::keyed_hash(&self.key, client_id.as_bytes())
            .to_hex()
            .to_string()
    }
}

impl fmt::Debug for Anonymizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anonymizer").finish_non_exhaustive()
    }
}

/// Identifier-cache key for a normalized request.
pub fn content_hash(host: &str, path: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(host.as_bytes());
    hasher.update(path.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}
