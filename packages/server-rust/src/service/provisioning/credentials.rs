//! Default credential hasher.

use sha2::{Digest, Sha256};

use crate::traits::CredentialHasher;

/// Hex-encoded SHA-256 of a server-wide pepper followed by the plaintext.
#[derive(Debug, Clone, Default)]
pub struct Sha256Hasher {
    pepper: String,
}

impl Sha256Hasher {
    #[must_use]
    pub fn new(pepper: impl Into<String>) -> Self {
        Self {
            pepper: pepper.into(),
        }
    }
}

impl CredentialHasher for Sha256Hasher {
    fn digest(&self, plaintext: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.pepper.as_bytes());
        hasher.update(plaintext.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_hex() {
        let hasher = Sha256Hasher::default();
        assert_eq!(
            hasher.digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn pepper_changes_the_digest() {
        let plain = Sha256Hasher::default().digest("correct-horse");
        let peppered = Sha256Hasher::new("pepper").digest("correct-horse");
        assert_ne!(plain, peppered);
        assert_eq!(peppered.len(), 64);
    }
}
