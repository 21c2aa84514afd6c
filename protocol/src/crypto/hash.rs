//! # Hashing Utilities
//!
//! - **BLAKE3** is the default: overlay record hashes and anything that
//!   only Bazaar nodes ever look at.
//! - **SHA-256** is kept for identifiers that end up next to Bitcoin data
//!   (transaction ids), where the rest of the world expects it.

use sha2::{Digest, Sha256};

/// Compute the BLAKE3 hash of the input data.
///
/// ```
/// use bazaar_protocol::crypto::blake3_hash;
///
/// assert_eq!(blake3_hash(b"offer").len(), 32);
/// ```
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Compute the SHA-256 hash of the input data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash a record together with its sequence number. This is the message a
/// maker signs for add/refresh/remove announcements, so a replayed refresh
/// with an old sequence number never verifies against a new one.
pub fn sequenced_hash(record_hash: &[u8; 32], sequence_number: u64) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(record_hash);
    hasher.update(&sequence_number.to_be_bytes());
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_is_deterministic() {
        assert_eq!(blake3_hash(b"bazaar"), blake3_hash(b"bazaar"));
        assert_ne!(blake3_hash(b"bazaar"), blake3_hash(b"bazaar!"));
    }

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sequence_number_changes_the_hash() {
        let record = blake3_hash(b"record");
        assert_ne!(sequenced_hash(&record, 1), sequenced_hash(&record, 2));
    }
}
