//! Key-value backing store boundary
//!
//! The coordinator delegates durability and consensus to a replicated
//! key-value store. This module defines the narrow interface the topology
//! adapter consumes: get, put, CAS on last-observed revision, prefix scan,
//! delete. Two implementations are provided: an in-memory store for tests and
//! single-process use, and a RocksDB-backed store for durable single-node
//! deployments.

use crate::common::{Error, Result};
use rocksdb::{Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// A stored value together with the revision that wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub revision: u64,
}

/// Revision passed to `cas` to mean "create, key must not exist".
pub const REVISION_NONE: u64 = 0;

pub trait KvBackend: Send + Sync {
    /// Linearizable read of a single key.
    fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Unconditional write. Returns the new revision.
    fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;

    /// Compare-and-swap on the last observed revision. `expected` =
    /// `REVISION_NONE` requires the key to be absent (create). Returns the
    /// new revision; fails with `StaleVersion` on mismatch.
    fn cas(&self, key: &str, expected: u64, value: Vec<u8>) -> Result<u64>;

    /// All key/value pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>>;

    fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory backend. Revisions are per-key counters starting at 1.
pub struct MemKv {
    inner: Mutex<BTreeMap<String, VersionedValue>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvBackend for MemKv {
    fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let revision = inner.get(key).map(|v| v.revision).unwrap_or(0) + 1;
        inner.insert(key.to_string(), VersionedValue { value, revision });
        Ok(revision)
    }

    fn cas(&self, key: &str, expected: u64, value: Vec<u8>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.get(key).map(|v| v.revision).unwrap_or(REVISION_NONE);
        if current != expected {
            return Err(Error::StaleVersion {
                key: key.to_string(),
                expected,
                found: current,
            });
        }
        let revision = current + 1;
        inner.insert(key.to_string(), VersionedValue { value, revision });
        Ok(revision)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(key);
        Ok(())
    }
}

/// RocksDB-backed backend. Values are stored as `revision (8 bytes LE) ||
/// payload`; writes are serialized through a mutex so CAS is atomic within
/// the process.
pub struct RocksKv {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn decode(raw: &[u8]) -> Result<VersionedValue> {
        if raw.len() < 8 {
            return Err(Error::Corrupted("kv value shorter than revision header".into()));
        }
        let revision = u64::from_le_bytes(raw[..8].try_into().unwrap());
        Ok(VersionedValue {
            value: raw[8..].to_vec(),
            revision,
        })
    }

    fn encode(revision: u64, value: &[u8]) -> Vec<u8> {
        let mut raw = Vec::with_capacity(8 + value.len());
        raw.extend_from_slice(&revision.to_le_bytes());
        raw.extend_from_slice(value);
        raw
    }
}

impl KvBackend for RocksKv {
    fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        match self.db.get(key.as_bytes())? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let _guard = self.write_lock.lock().unwrap();
        let revision = match self.db.get(key.as_bytes())? {
            Some(raw) => Self::decode(&raw)?.revision + 1,
            None => 1,
        };
        self.db.put(key.as_bytes(), Self::encode(revision, &value))?;
        Ok(revision)
    }

    fn cas(&self, key: &str, expected: u64, value: Vec<u8>) -> Result<u64> {
        let _guard = self.write_lock.lock().unwrap();
        let current = match self.db.get(key.as_bytes())? {
            Some(raw) => Self::decode(&raw)?.revision,
            None => REVISION_NONE,
        };
        if current != expected {
            return Err(Error::StaleVersion {
                key: key.to_string(),
                expected,
                found: current,
            });
        }
        let revision = current + 1;
        self.db.put(key.as_bytes(), Self::encode(revision, &value))?;
        Ok(revision)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>> {
        let mode = rocksdb::IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward);
        let mut out = Vec::new();
        for item in self.db.iterator(mode) {
            let (key_bytes, value_bytes) = item?;
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| Error::Corrupted("non-utf8 key".into()))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, Self::decode(&value_bytes)?));
        }
        Ok(out)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.delete(key.as_bytes())?;
        Ok(())
    }
}
