//! Topology entity records
//!
//! These structs are the durable representation of cluster metadata. They are
//! encoded with bincode, so field declaration order and enum variant order are
//! the wire format and must not be reordered across versions.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Root aggregate. Immutable after creation except through an explicit
/// cluster-evolution procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub min_node_count: u32,
    pub replication_factor: u32,
    pub shard_total: u32,
    pub created_at: u64,
}

/// Logical table namespace within a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub id: SchemaId,
    pub cluster_id: ClusterId,
    pub name: String,
    pub created_at: u64,
}

/// A table. The shard assignment lives in ShardView, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub name: String,
    pub schema_id: SchemaId,
    pub created_at: u64,
}

/// Authoritative list of tables on a shard. `version` is a monotonic counter
/// incremented on every mutation; writers must present the observed version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardView {
    pub shard_id: ShardId,
    pub version: u64,
    pub table_ids: Vec<TableId>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardRole {
    Leader,
    Follower,
}

/// A shard-to-node assignment tuple
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardNode {
    pub shard_id: ShardId,
    pub role: ShardRole,
    pub node_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    Empty,
    Stable,
}

/// Authoritative placement of shards onto nodes, versioned like ShardView.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    pub cluster_id: ClusterId,
    pub version: u64,
    pub state: ClusterState,
    pub shard_nodes: Vec<ShardNode>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    pub lease: u32,
    pub zone: String,
    pub node_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Online,
    Offline,
}

/// A registered data-plane node. Liveness is derived from `last_touch_time`
/// against the configured lease; `state` is a persisted snapshot for
/// observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub stats: NodeStats,
    pub created_at: u64,
    pub last_touch_time: u64,
    pub state: NodeState,
}

/// Procedure lifecycle envelope, shared by every procedure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureState {
    Init,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl ProcedureState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcedureState::Finished | ProcedureState::Failed | ProcedureState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcedureKind {
    CreateTable,
    DropTable,
    TransferLeader,
    SplitShard,
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureKind::CreateTable => write!(f, "create_table"),
            ProcedureKind::DropTable => write!(f, "drop_table"),
            ProcedureKind::TransferLeader => write!(f, "transfer_leader"),
            ProcedureKind::SplitShard => write!(f, "split_shard"),
        }
    }
}

/// Durable progress record of a procedure. `payload` is the kind-specific
/// state, opaque at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureRecord {
    pub id: u64,
    pub kind: ProcedureKind,
    pub state: ProcedureState,
    pub payload: Vec<u8>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ClusterView {
    /// Leader node for a shard in this view, if any
    pub fn leader_of(&self, shard_id: ShardId) -> Option<&str> {
        self.shard_nodes
            .iter()
            .find(|sn| sn.shard_id == shard_id && sn.role == ShardRole::Leader)
            .map(|sn| sn.node_name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_encode_decode_identity() {
        let cluster = Cluster {
            id: ClusterId(1),
            name: "prod".to_string(),
            min_node_count: 3,
            replication_factor: 1,
            shard_total: 256,
            created_at: 1700000000000,
        };
        let bytes = bincode::serialize(&cluster).unwrap();
        let decoded: Cluster = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, cluster);

        let view = ShardView {
            shard_id: ShardId(7),
            version: 3,
            table_ids: vec![TableId(10), TableId(11)],
            created_at: 1700000000000,
        };
        let bytes = bincode::serialize(&view).unwrap();
        let decoded: ShardView = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, view);

        let node = Node {
            name: "10.0.0.3:8831".to_string(),
            stats: NodeStats {
                lease: 15,
                zone: "az-1".to_string(),
                node_version: "1.2.0".to_string(),
            },
            created_at: 1700000000000,
            last_touch_time: 1700000000123,
            state: NodeState::Online,
        };
        let bytes = bincode::serialize(&node).unwrap();
        let decoded: Node = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn test_leader_of() {
        let view = ClusterView {
            cluster_id: ClusterId(1),
            version: 2,
            state: ClusterState::Stable,
            shard_nodes: vec![
                ShardNode {
                    shard_id: ShardId(0),
                    role: ShardRole::Leader,
                    node_name: "n1".to_string(),
                },
                ShardNode {
                    shard_id: ShardId(1),
                    role: ShardRole::Follower,
                    node_name: "n2".to_string(),
                },
            ],
            created_at: 0,
        };
        assert_eq!(view.leader_of(ShardId(0)), Some("n1"));
        assert_eq!(view.leader_of(ShardId(1)), None);
    }
}
