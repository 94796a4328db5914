//! One cluster's in-memory topology: the metadata cache and the node registry
//!
//! The cache is the single place shared mutable metadata lives; mutators run a
//! store CAS inside the write critical section and apply the change to the
//! indices only on success. The registry tracks heartbeat liveness.

pub mod metadata;
pub mod registry;

use crate::storage::types::{Node, SchemaId, ShardId, ShardRole, TableId};
use serde::{Deserialize, Serialize};

pub use metadata::ClusterMetadata;
pub use registry::NodeRegistry;

/// A shard as reported to or by a data-plane node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub role: ShardRole,
    pub version: u64,
}

/// Table identity handed to data-plane nodes alongside shard commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub schema_id: SchemaId,
    pub schema_name: String,
}

/// Version fence for a shard command: the recipient applies the update only
/// if its current shard version equals `prev_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateShardInfo {
    pub curr_shard_info: ShardInfo,
    pub prev_version: u64,
}

/// Result of a successful CAS on a shard view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardVersionUpdate {
    pub shard_id: ShardId,
    pub prev_version: u64,
    pub curr_version: u64,
}

/// A node as known to the registry: durable record plus reported shards
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredNode {
    pub node: Node,
    pub endpoint: String,
    pub shard_infos: Vec<ShardInfo>,
}
