/*!
Password digests and unpredictable identifiers
*/

use std::fmt;

use rand::Rng;

use crate::core::config::CredentialsConfig;

const KEY_DERIVATION_CONTEXT: &str = "uptime-monitor credentials v1 password digest";
const IDENTIFIER_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Keyed one-way hashing with a single process-wide key
pub struct Credentials {
    key: [u8; 32],
}

impl Credentials {
    pub fn new(config: &CredentialsConfig) -> Self {
        Self {
            key: blake3::derive_key(KEY_DERIVATION_CONTEXT, config.hashing_secret.as_bytes()),
        }
    }

    /// Hex digest of `secret`, or `None` when there is nothing to hash
    pub fn hash(&self, secret: &str) -> Option<String> {
        if secret.is_empty() {
            return None;
        }
        Some(blake3::keyed_hash(&self.key, secret.as_bytes()).to_hex().to_string())
    }

    /// Whether `secret` hashes to `digest`. Comparison is constant-time.
    pub fn matches(&self, secret: &str, digest: &str) -> bool {
        if secret.is_empty() {
            return false;
        }
        match blake3::Hash::from_hex(digest) {
            Ok(stored) => blake3::keyed_hash(&self.key, secret.as_bytes()) == stored,
            Err(_) => false,
        }
    }

    /// `length` characters drawn uniformly from lowercase letters and digits
    pub fn random_identifier(length: usize) -> Option<String> {
        if length == 0 {
            return None;
        }
        let mut rng = rand::thread_rng();
        Some(
            (0..length)
                .map(|_| IDENTIFIER_ALPHABET[rng.gen_range(0..IDENTIFIER_ALPHABET.len())] as char)
                .collect(),
        )
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").finish_non_exhaustive()
    }
}
