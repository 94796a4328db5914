//! Durable topology state
//!
//! - Entity records and their bincode wire format
//! - Structured key layout over the backing store
//! - The key-value boundary (get/put/CAS/scan/delete) with in-memory and
//!   RocksDB implementations
//! - The typed CRUD-with-version adapter the rest of the coordinator uses

pub mod keys;
pub mod kv;
pub mod store;
pub mod types;

pub use kv::{KvBackend, MemKv, RocksKv, VersionedValue};
pub use store::TopologyStore;
pub use types::*;
