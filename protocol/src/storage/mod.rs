//! # Storage Module
//!
//! Persistence for open offers and trades. Collections are stored as whole
//! bincode blobs under fixed names; see [`store`] for the layout.
//!
//! Bincode for on-disk serialization: compact, fast, deterministic. The
//! local-only offer state is not stored and is rebuilt on load.

pub mod store;

pub use store::{
    load_collection, save_collection, MemoryStore, PersistenceStore, SledStore, StoreError,
    StoreResult,
};
