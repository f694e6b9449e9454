//! Durable key-value seam backing override persistence

use crate::error::{GeoError, GeoResult};
use dashmap::DashMap;
use std::path::Path;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> GeoResult<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> GeoResult<()>;
    fn remove(&self, key: &str) -> GeoResult<()>;
}

/// sled-backed durable store. Writes are flushed so an override survives a
/// process restart.
#[derive(Debug)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> GeoResult<Self> {
        let db = sled::open(path).map_err(|e| GeoError::Storage(e.to_string()))?;
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &str) -> GeoResult<Option<Vec<u8>>> {
        let value = self
            .db
            .get(key)
            .map_err(|e| GeoError::Storage(e.to_string()))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> GeoResult<()> {
        self.db
            .insert(key, value)
            .map_err(|e| GeoError::Storage(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| GeoError::Storage(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> GeoResult<()> {
        self.db
            .remove(key)
            .map_err(|e| GeoError::Storage(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| GeoError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// In-memory store for tests and compositions that do not need durability
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> GeoResult<Option<Vec<u8>>> {
        Ok(self.map.get(key).map(|v| v.clone()))
    }

    fn set(&self, key: &str, value: &[u8]) -> GeoResult<()> {
        self.map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> GeoResult<()> {
        self.map.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.set("k", b"value").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"value"[..]));

        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn sled_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.set("override", b"payload").unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get("override").unwrap().as_deref(),
            Some(&b"payload"[..])
        );
    }
}
