//! # Persistence Store
//!
//! Named blobs, written whole. Each manager persists its collections under
//! a fixed name after every change that must survive a restart:
//!
//! | Name              | Value                               |
//! |-------------------|-------------------------------------|
//! | `OpenOffers`      | `bincode(Vec<OpenOffer>)`           |
//! | `ClosedOffers`    | `bincode(Vec<OpenOffer>)`           |
//! | `OpenOfferTrades` | `bincode(Vec<Trade>)`               |
//! | `PendingTrades`   | `bincode(Vec<Trade>)`               |
//! | `ClosedTrades`    | `bincode(Vec<Trade>)`               |
//! | `FailedTrades`    | `bincode(Vec<Trade>)`               |
//!
//! [`SledStore`] keeps them in a single sled tree and flushes on every
//! write. [`MemoryStore`] is the same contract in a `HashMap`, for tests.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};

pub const OPEN_OFFERS: &str = "OpenOffers";
pub const CLOSED_OFFERS: &str = "ClosedOffers";
pub const OPEN_OFFER_TRADES: &str = "OpenOfferTrades";
pub const PENDING_TRADES: &str = "PendingTrades";
pub const CLOSED_TRADES: &str = "ClosedTrades";
pub const FAILED_TRADES: &str = "FailedTrades";

const TREE_NAME: &str = "collections";

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Blob storage the managers persist into.
pub trait PersistenceStore: Send + Sync {
    fn save(&self, name: &str, blob: &[u8]) -> StoreResult<()>;
    fn load(&self, name: &str) -> StoreResult<Option<Vec<u8>>>;
}

/// Serialize `value` with bincode and save it under `name`.
pub fn save_collection<T: Serialize + ?Sized>(
    store: &dyn PersistenceStore,
    name: &str,
    value: &T,
) -> StoreResult<()> {
    let blob = bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.save(name, &blob)
}

/// Load and deserialize the collection under `name`, or `T::default()` if
/// nothing was saved yet.
pub fn load_collection<T: DeserializeOwned + Default>(
    store: &dyn PersistenceStore,
    name: &str,
) -> StoreResult<T> {
    match store.load(name)? {
        Some(blob) => {
            bincode::deserialize(&blob).map_err(|e| StoreError::Serialization(e.to_string()))
        }
        None => Ok(T::default()),
    }
}

// ---------------------------------------------------------------------------
// SledStore
// ---------------------------------------------------------------------------

/// sled-backed store. Cheap to clone; clones share the database.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
    collections: Tree,
}

impl SledStore {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A database that lives in a temp directory and is removed on drop.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let collections = db.open_tree(TREE_NAME)?;
        Ok(Self { db, collections })
    }

    /// Bytes used on disk.
    pub fn size_on_disk(&self) -> StoreResult<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

impl PersistenceStore for SledStore {
    fn save(&self, name: &str, blob: &[u8]) -> StoreResult<()> {
        self.collections.insert(name.as_bytes(), blob)?;
        self.collections.flush()?;
        Ok(())
    }

    fn load(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.collections.get(name.as_bytes())?.map(|v| v.to_vec()))
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceStore for MemoryStore {
    fn save(&self, name: &str, blob: &[u8]) -> StoreResult<()> {
        self.blobs.lock().insert(name.to_string(), blob.to_vec());
        Ok(())
    }

    fn load(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_collection_loads_default() {
        let store = MemoryStore::new();
        let loaded: Vec<u64> = load_collection(&store, PENDING_TRADES).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn sled_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            save_collection(&store, CLOSED_TRADES, &vec!["a".to_string(), "b".to_string()])
                .unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        let loaded: Vec<String> = load_collection(&store, CLOSED_TRADES).unwrap();
        assert_eq!(loaded, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn save_overwrites() {
        let store = SledStore::open_temporary().unwrap();
        save_collection(&store, OPEN_OFFERS, &vec![1u8]).unwrap();
        save_collection(&store, OPEN_OFFERS, &vec![2u8, 3]).unwrap();
        let loaded: Vec<u8> = load_collection(&store, OPEN_OFFERS).unwrap();
        assert_eq!(loaded, vec![2, 3]);
    }

    #[test]
    fn corrupt_blob_is_an_error() {
        let store = MemoryStore::new();
        store.save(FAILED_TRADES, &[0xFF]).unwrap();
        let loaded: StoreResult<Vec<String>> = load_collection(&store, FAILED_TRADES);
        assert!(matches!(loaded, Err(StoreError::Serialization(_))));
    }
}
