//! Topology store adapter
//!
//! Typed read/write of cluster, schema, table, shard-view, node and
//! cluster-view records over the key-value backing store. Every update takes
//! the caller's last-observed entity version and turns a mismatch into
//! `StaleVersion`; creates require the key to be absent. Reads are
//! linearizable because the backing store's are.

use crate::common::{Error, Result};
use crate::storage::keys;
use crate::storage::kv::{KvBackend, VersionedValue, REVISION_NONE};
use crate::storage::types::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

pub struct TopologyStore {
    kv: Arc<dyn KvBackend>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(raw: &VersionedValue) -> Result<T> {
    Ok(bincode::deserialize(&raw.value)?)
}

impl TopologyStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    // === Cluster ===

    pub fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        let key = keys::cluster_key(cluster.id);
        self.kv
            .cas(&key, REVISION_NONE, encode(cluster)?)
            .map_err(|e| match e {
                Error::StaleVersion { .. } => Error::AlreadyExists(format!("cluster {}", cluster.id)),
                other => other,
            })?;
        Ok(())
    }

    pub fn get_cluster(&self, id: ClusterId) -> Result<Option<Cluster>> {
        match self.kv.get(&keys::cluster_key(id))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    // === Schema ===

    pub fn create_schema(&self, schema: &Schema) -> Result<()> {
        let key = keys::schema_key(schema.cluster_id, schema.id);
        self.kv
            .cas(&key, REVISION_NONE, encode(schema)?)
            .map_err(|e| match e {
                Error::StaleVersion { .. } => Error::AlreadyExists(format!("schema {}", schema.name)),
                other => other,
            })?;
        Ok(())
    }

    pub fn list_schemas(&self, cluster: ClusterId) -> Result<Vec<Schema>> {
        self.kv
            .scan_prefix(&keys::schema_prefix(cluster))?
            .iter()
            .map(|(_, raw)| decode(raw))
            .collect()
    }

    // === Table ===

    pub fn create_table(&self, cluster: ClusterId, table: &Table) -> Result<()> {
        let key = keys::table_key(cluster, table.id);
        self.kv
            .cas(&key, REVISION_NONE, encode(table)?)
            .map_err(|e| match e {
                Error::StaleVersion { .. } => Error::AlreadyExists(format!("table {}", table.name)),
                other => other,
            })?;
        Ok(())
    }

    pub fn delete_table(&self, cluster: ClusterId, table: TableId) -> Result<()> {
        self.kv.delete(&keys::table_key(cluster, table))
    }

    /// Tables of a cluster, optionally restricted to one schema.
    pub fn list_tables(&self, cluster: ClusterId, schema: Option<SchemaId>) -> Result<Vec<Table>> {
        let tables: Vec<Table> = self
            .kv
            .scan_prefix(&keys::table_prefix(cluster))?
            .iter()
            .map(decode_entry)
            .collect::<Result<_>>()?;
        Ok(match schema {
            Some(id) => tables.into_iter().filter(|t| t.schema_id == id).collect(),
            None => tables,
        })
    }

    // === ShardView ===

    pub fn create_shard_view(&self, cluster: ClusterId, view: &ShardView) -> Result<()> {
        let key = keys::shard_view_key(cluster, view.shard_id);
        self.kv
            .cas(&key, REVISION_NONE, encode(view)?)
            .map_err(|e| match e {
                Error::StaleVersion { .. } => {
                    Error::AlreadyExists(format!("shard view {}", view.shard_id))
                }
                other => other,
            })?;
        Ok(())
    }

    pub fn get_shard_view(&self, cluster: ClusterId, shard: ShardId) -> Result<Option<ShardView>> {
        match self.kv.get(&keys::shard_view_key(cluster, shard))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Shard views for the given ids; an empty id list means all of them.
    pub fn list_shard_views(
        &self,
        cluster: ClusterId,
        shard_ids: &[ShardId],
    ) -> Result<Vec<ShardView>> {
        let views: Vec<ShardView> = self
            .kv
            .scan_prefix(&keys::shard_view_prefix(cluster))?
            .iter()
            .map(decode_entry)
            .collect::<Result<_>>()?;
        if shard_ids.is_empty() {
            return Ok(views);
        }
        Ok(views
            .into_iter()
            .filter(|v| shard_ids.contains(&v.shard_id))
            .collect())
    }

    /// CAS update against the caller's last-observed `ShardView.version`.
    pub fn update_shard_view(
        &self,
        cluster: ClusterId,
        view: &ShardView,
        latest_version: u64,
    ) -> Result<()> {
        let key = keys::shard_view_key(cluster, view.shard_id);
        let raw = self
            .kv
            .get(&key)?
            .ok_or_else(|| Error::NotFound(format!("shard view {}", view.shard_id)))?;
        let current: ShardView = decode(&raw)?;
        if current.version != latest_version || view.version <= current.version {
            return Err(Error::StaleVersion {
                key,
                expected: latest_version,
                found: current.version,
            });
        }
        self.kv.cas(&key, raw.revision, encode(view)?)?;
        Ok(())
    }

    // === ClusterView ===

    pub fn create_cluster_view(&self, view: &ClusterView) -> Result<()> {
        let key = keys::cluster_view_key(view.cluster_id);
        self.kv
            .cas(&key, REVISION_NONE, encode(view)?)
            .map_err(|e| match e {
                Error::StaleVersion { .. } => {
                    Error::AlreadyExists(format!("cluster view {}", view.cluster_id))
                }
                other => other,
            })?;
        Ok(())
    }

    pub fn get_cluster_view(&self, cluster: ClusterId) -> Result<Option<ClusterView>> {
        match self.kv.get(&keys::cluster_view_key(cluster))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn update_cluster_view(&self, view: &ClusterView, latest_version: u64) -> Result<()> {
        let key = keys::cluster_view_key(view.cluster_id);
        let raw = self
            .kv
            .get(&key)?
            .ok_or_else(|| Error::NotFound(format!("cluster view {}", view.cluster_id)))?;
        let current: ClusterView = decode(&raw)?;
        if current.version != latest_version || view.version <= current.version {
            return Err(Error::StaleVersion {
                key,
                expected: latest_version,
                found: current.version,
            });
        }
        self.kv.cas(&key, raw.revision, encode(view)?)?;
        Ok(())
    }

    // === Node ===

    pub fn create_or_update_node(&self, cluster: ClusterId, node: &Node) -> Result<()> {
        self.kv
            .put(&keys::node_key(cluster, &node.name), encode(node)?)?;
        Ok(())
    }

    pub fn list_nodes(&self, cluster: ClusterId) -> Result<Vec<Node>> {
        self.kv
            .scan_prefix(&keys::node_prefix(cluster))?
            .iter()
            .map(decode_entry)
            .collect()
    }

    // === Procedure ===

    pub fn save_procedure(&self, cluster: ClusterId, record: &ProcedureRecord) -> Result<()> {
        self.kv
            .put(&keys::procedure_key(cluster, record.id), encode(record)?)?;
        Ok(())
    }

    pub fn get_procedure(&self, cluster: ClusterId, id: u64) -> Result<Option<ProcedureRecord>> {
        match self.kv.get(&keys::procedure_key(cluster, id))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn list_procedures(&self, cluster: ClusterId) -> Result<Vec<ProcedureRecord>> {
        self.kv
            .scan_prefix(&keys::procedure_prefix(cluster))?
            .iter()
            .map(decode_entry)
            .collect()
    }

    // === Id allocation ===

    /// Allocate the next id for `kind` via a CAS-incremented counter record.
    pub fn alloc_id(&self, cluster: ClusterId, kind: &str) -> Result<u64> {
        let key = keys::id_alloc_key(cluster, kind);
        loop {
            match self.kv.get(&key)? {
                None => {
                    let next: u64 = 1;
                    match self.kv.cas(&key, REVISION_NONE, encode(&next)?) {
                        Ok(_) => return Ok(next),
                        Err(Error::StaleVersion { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Some(raw) => {
                    let current: u64 = decode(&raw)?;
                    let next = current + 1;
                    match self.kv.cas(&key, raw.revision, encode(&next)?) {
                        Ok(_) => return Ok(next),
                        Err(Error::StaleVersion { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

fn decode_entry<T: DeserializeOwned>(entry: &(String, VersionedValue)) -> Result<T> {
    decode(&entry.1)
}
