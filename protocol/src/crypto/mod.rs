//! # Cryptographic Primitives
//!
//! Node identity keys and hashing. A node signs the overlay records of its
//! own offers so that nobody else can refresh or withdraw them; everything
//! else in the exchange protocol is authenticated by the connection it
//! arrives on.
//!
//! Thin wrappers around audited crates only: `ed25519-dalek` for signatures,
//! `blake3` and `sha2` for hashing.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, sha256};
pub use keys::{KeyError, NodeKeypair, NodePublicKey, NodeSignature};
