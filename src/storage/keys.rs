//! Key layout for the backing store
//!
//! Keys are structured `/ceresmeta/v1/<cluster>/<entity>/<id>` with separate
//! key spaces per entity. The layout outlives processes, so it never changes.

use crate::storage::types::{ClusterId, SchemaId, ShardId, TableId};

pub const ROOT: &str = "/ceresmeta/v1";

pub fn cluster_key(cluster: ClusterId) -> String {
    format!("{}/cluster/{}", ROOT, cluster)
}

pub fn schema_prefix(cluster: ClusterId) -> String {
    format!("{}/{}/schema/", ROOT, cluster)
}

pub fn schema_key(cluster: ClusterId, schema: SchemaId) -> String {
    format!("{}{:010}", schema_prefix(cluster), schema.0)
}

pub fn table_prefix(cluster: ClusterId) -> String {
    format!("{}/{}/table/", ROOT, cluster)
}

pub fn table_key(cluster: ClusterId, table: TableId) -> String {
    format!("{}{:020}", table_prefix(cluster), table.0)
}

pub fn shard_view_prefix(cluster: ClusterId) -> String {
    format!("{}/{}/shard_view/", ROOT, cluster)
}

pub fn shard_view_key(cluster: ClusterId, shard: ShardId) -> String {
    format!("{}{:010}", shard_view_prefix(cluster), shard.0)
}

pub fn cluster_view_key(cluster: ClusterId) -> String {
    format!("{}/{}/cluster_view", ROOT, cluster)
}

pub fn node_prefix(cluster: ClusterId) -> String {
    format!("{}/{}/node/", ROOT, cluster)
}

pub fn node_key(cluster: ClusterId, name: &str) -> String {
    format!("{}{}", node_prefix(cluster), name)
}

pub fn procedure_prefix(cluster: ClusterId) -> String {
    format!("{}/{}/procedure/", ROOT, cluster)
}

pub fn procedure_key(cluster: ClusterId, id: u64) -> String {
    format!("{}{:020}", procedure_prefix(cluster), id)
}

pub fn id_alloc_key(cluster: ClusterId, kind: &str) -> String {
    format!("{}/{}/id_alloc/{}", ROOT, cluster, kind)
}
