//! Cluster metadata cache
//!
//! In-memory materialization of one cluster's topology. Rebuilt by a full
//! rescan on leadership acquisition and incrementally updated by successful
//! mutations. Lookups take the read lock; mutations take the write lock, run
//! the store CAS inside the critical section and update the indices only on
//! success. On `StaleVersion` the affected entity is reread from the store
//! before the error is returned, so the caller's retry sees fresh state.

use crate::cluster::{ShardVersionUpdate, TableInfo};
use crate::common::config::ClusterConfig;
use crate::common::{timestamp_now_millis, Error, Result};
use crate::storage::types::*;
use crate::storage::TopologyStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

const ID_KIND_SCHEMA: &str = "schema";
const ID_KIND_TABLE: &str = "table";

/// Routing result: the shard a table lives on and the shard's leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResult {
    pub table: Table,
    pub shard_id: ShardId,
    pub leader_node: String,
}

struct Topology {
    cluster: Cluster,
    schemas_by_name: HashMap<String, Schema>,
    tables_by_name: HashMap<(SchemaId, String), Table>,
    shard_views: HashMap<ShardId, ShardView>,
    table_shard: HashMap<TableId, ShardId>,
    cluster_view: ClusterView,
    nodes: HashMap<String, Node>,
}

impl Topology {
    fn shard_leader(&self, shard_id: ShardId) -> Option<String> {
        self.cluster_view.leader_of(shard_id).map(|s| s.to_string())
    }
}

pub struct ClusterMetadata {
    cluster_id: ClusterId,
    config: ClusterConfig,
    store: Arc<TopologyStore>,
    inner: RwLock<Option<Topology>>,
    generation: AtomicU64,
}

impl ClusterMetadata {
    pub fn new(store: Arc<TopologyStore>, cluster_id: ClusterId, config: ClusterConfig) -> Self {
        Self {
            cluster_id,
            config,
            store,
            inner: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// Counter incremented on every successful mutation, so callers can
    /// detect concurrent topology change between two lookups.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().unwrap().is_some()
    }

    /// Create the durable skeleton of an empty cluster if it does not exist:
    /// the cluster record, one shard view per shard, and an empty cluster
    /// view. Safe to call on every startup.
    pub fn bootstrap(&self) -> Result<()> {
        let now = timestamp_now_millis();
        if self.store.get_cluster(self.cluster_id)?.is_none() {
            let cluster = Cluster {
                id: self.cluster_id,
                name: self.config.name.clone(),
                min_node_count: self.config.min_node_count,
                replication_factor: self.config.replication_factor,
                shard_total: self.config.num_total_shards,
                created_at: now,
            };
            match self.store.create_cluster(&cluster) {
                Ok(()) => tracing::info!("created cluster {} ({})", cluster.name, cluster.id),
                Err(Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if self.store.get_cluster_view(self.cluster_id)?.is_none() {
            let view = ClusterView {
                cluster_id: self.cluster_id,
                version: 0,
                state: ClusterState::Empty,
                shard_nodes: vec![],
                created_at: now,
            };
            match self.store.create_cluster_view(&view) {
                Ok(()) | Err(Error::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let existing = self.store.list_shard_views(self.cluster_id, &[])?;
        if existing.len() < self.config.num_total_shards as usize {
            let have: Vec<ShardId> = existing.iter().map(|v| v.shard_id).collect();
            for shard in 0..self.config.num_total_shards {
                let shard_id = ShardId(shard);
                if have.contains(&shard_id) {
                    continue;
                }
                let view = ShardView {
                    shard_id,
                    version: 0,
                    table_ids: vec![],
                    created_at: now,
                };
                match self.store.create_shard_view(self.cluster_id, &view) {
                    Ok(()) | Err(Error::AlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Full rescan of the backing store; called on leadership acquisition.
    pub fn load(&self) -> Result<()> {
        let cluster = self
            .store
            .get_cluster(self.cluster_id)?
            .ok_or_else(|| Error::NotFound(format!("cluster {}", self.cluster_id)))?;
        let schemas = self.store.list_schemas(self.cluster_id)?;
        let tables = self.store.list_tables(self.cluster_id, None)?;
        let shard_views = self.store.list_shard_views(self.cluster_id, &[])?;
        let cluster_view = self
            .store
            .get_cluster_view(self.cluster_id)?
            .ok_or_else(|| Error::NotFound(format!("cluster view {}", self.cluster_id)))?;
        let nodes = self.store.list_nodes(self.cluster_id)?;

        let schemas_by_name: HashMap<String, Schema> =
            schemas.into_iter().map(|s| (s.name.clone(), s)).collect();
        let tables_by_name: HashMap<(SchemaId, String), Table> = tables
            .into_iter()
            .map(|t| ((t.schema_id, t.name.clone()), t))
            .collect();
        let mut table_shard = HashMap::new();
        let mut views_by_id = HashMap::new();
        for view in shard_views {
            for table_id in &view.table_ids {
                table_shard.insert(*table_id, view.shard_id);
            }
            views_by_id.insert(view.shard_id, view);
        }
        let nodes = nodes.into_iter().map(|n| (n.name.clone(), n)).collect();

        let topology = Topology {
            cluster,
            schemas_by_name,
            tables_by_name,
            shard_views: views_by_id,
            table_shard,
            cluster_view,
            nodes,
        };

        let mut inner = self.inner.write().unwrap();
        *inner = Some(topology);
        tracing::info!(
            cluster = %self.cluster_id,
            "metadata cache loaded from store"
        );
        Ok(())
    }

    /// Drop the in-memory projection; called on leadership loss.
    pub fn invalidate(&self) {
        let mut inner = self.inner.write().unwrap();
        *inner = None;
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    // === Lookups ===

    pub fn get_cluster(&self) -> Result<Cluster> {
        let inner = self.inner.read().unwrap();
        let topo = loaded(&inner)?;
        Ok(topo.cluster.clone())
    }

    pub fn get_schema(&self, name: &str) -> Result<Option<Schema>> {
        let inner = self.inner.read().unwrap();
        let topo = loaded(&inner)?;
        Ok(topo.schemas_by_name.get(name).cloned())
    }

    pub fn get_table(&self, schema_name: &str, table_name: &str) -> Result<Option<Table>> {
        let inner = self.inner.read().unwrap();
        let topo = loaded(&inner)?;
        let schema = match topo.schemas_by_name.get(schema_name) {
            Some(s) => s,
            None => return Ok(None),
        };
        Ok(topo
            .tables_by_name
            .get(&(schema.id, table_name.to_string()))
            .cloned())
    }

    pub fn get_shard_view(&self, shard_id: ShardId) -> Result<Option<ShardView>> {
        let inner = self.inner.read().unwrap();
        let topo = loaded(&inner)?;
        Ok(topo.shard_views.get(&shard_id).cloned())
    }

    pub fn get_cluster_view(&self) -> Result<ClusterView> {
        let inner = self.inner.read().unwrap();
        let topo = loaded(&inner)?;
        Ok(topo.cluster_view.clone())
    }

    pub fn shard_leader(&self, shard_id: ShardId) -> Result<Option<String>> {
        let inner = self.inner.read().unwrap();
        let topo = loaded(&inner)?;
        Ok(topo.shard_leader(shard_id))
    }

    pub fn shard_of_table(&self, table_id: TableId) -> Result<Option<ShardId>> {
        let inner = self.inner.read().unwrap();
        let topo = loaded(&inner)?;
        Ok(topo.table_shard.get(&table_id).copied())
    }

    /// Resolve table -> shard -> leader node.
    pub fn route(&self, schema_name: &str, table_name: &str) -> Result<RouteResult> {
        let inner = self.inner.read().unwrap();
        let topo = loaded(&inner)?;
        let schema = topo
            .schemas_by_name
            .get(schema_name)
            .ok_or_else(|| Error::NotFound(format!("schema {}", schema_name)))?;
        let table = topo
            .tables_by_name
            .get(&(schema.id, table_name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("table {}.{}", schema_name, table_name)))?;
        let shard_id = topo
            .table_shard
            .get(&table.id)
            .copied()
            .ok_or_else(|| Error::Internal(format!("table {} has no shard", table.id)))?;
        let leader_node = topo
            .shard_leader(shard_id)
            .ok_or(Error::ShardLeaderNotFound(shard_id.0))?;
        Ok(RouteResult {
            table: table.clone(),
            shard_id,
            leader_node,
        })
    }

    // === Mutations ===

    /// Create a schema; creating an existing schema returns it unchanged.
    pub fn create_schema(&self, name: &str) -> Result<Schema> {
        let mut inner = self.inner.write().unwrap();
        let topo = loaded_mut(&mut inner)?;
        if let Some(existing) = topo.schemas_by_name.get(name) {
            tracing::warn!(schema = name, "create of existing schema, returning it");
            return Ok(existing.clone());
        }
        let id = SchemaId(self.store.alloc_id(self.cluster_id, ID_KIND_SCHEMA)? as u32);
        let schema = Schema {
            id,
            cluster_id: self.cluster_id,
            name: name.to_string(),
            created_at: timestamp_now_millis(),
        };
        self.store.create_schema(&schema)?;
        topo.schemas_by_name.insert(name.to_string(), schema.clone());
        self.bump_generation();
        Ok(schema)
    }

    /// Deterministic shard assignment for a new table.
    pub fn shard_of(&self, schema_name: &str, table_name: &str) -> Result<ShardId> {
        let inner = self.inner.read().unwrap();
        let topo = loaded(&inner)?;
        let qualified = format!("{}.{}", schema_name, table_name);
        let hash = blake3::hash(qualified.as_bytes());
        let h = u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap());
        Ok(ShardId((h % topo.cluster.shard_total as u64) as u32))
    }

    /// Create a table and add it to its shard view under CAS. Creating an
    /// existing table returns it with no version update.
    pub fn create_table(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<(Table, Option<ShardVersionUpdate>)> {
        let mut inner = self.inner.write().unwrap();
        let topo = loaded_mut(&mut inner)?;
        let schema = topo
            .schemas_by_name
            .get(schema_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("schema {}", schema_name)))?;

        let qualified = format!("{}.{}", schema_name, table_name);
        let hash = blake3::hash(qualified.as_bytes());
        let h = u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap());
        let shard_id = ShardId((h % topo.cluster.shard_total as u64) as u32);

        let table = match topo.tables_by_name.get(&(schema.id, table_name.to_string())) {
            Some(existing) if topo.table_shard.contains_key(&existing.id) => {
                tracing::warn!(
                    schema = schema_name,
                    table = table_name,
                    "create of existing table, returning it"
                );
                return Ok((existing.clone(), None));
            }
            // record exists but is on no shard view: an interrupted create,
            // finish the placement below
            Some(existing) => existing.clone(),
            None => {
                let table = Table {
                    id: TableId(self.store.alloc_id(self.cluster_id, ID_KIND_TABLE)?),
                    name: table_name.to_string(),
                    schema_id: schema.id,
                    created_at: timestamp_now_millis(),
                };
                self.store.create_table(self.cluster_id, &table)?;
                table
            }
        };

        let view = topo
            .shard_views
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("shard view {}", shard_id)))?;
        let prev_version = view.version;
        let mut updated = view;
        updated.version = prev_version + 1;
        updated.table_ids.push(table.id);
        if let Err(e) = self
            .store
            .update_shard_view(self.cluster_id, &updated, prev_version)
        {
            self.refresh_shard_view(topo, shard_id);
            return Err(e);
        }

        topo.table_shard.insert(table.id, shard_id);
        topo.shard_views.insert(shard_id, updated.clone());
        topo.tables_by_name
            .insert((schema.id, table_name.to_string()), table.clone());
        self.bump_generation();
        Ok((
            table,
            Some(ShardVersionUpdate {
                shard_id,
                prev_version,
                curr_version: updated.version,
            }),
        ))
    }

    /// Remove a table from its shard view under CAS and delete its record.
    /// Dropping an absent table returns `None`.
    pub fn drop_table(
        &self,
        schema_name: &str,
        table_name: &str,
    ) -> Result<Option<(TableInfo, ShardVersionUpdate)>> {
        let mut inner = self.inner.write().unwrap();
        let topo = loaded_mut(&mut inner)?;
        let schema = match topo.schemas_by_name.get(schema_name) {
            Some(s) => s.clone(),
            None => return Ok(None),
        };
        let table = match topo.tables_by_name.get(&(schema.id, table_name.to_string())) {
            Some(t) => t.clone(),
            None => return Ok(None),
        };
        let shard_id = match topo.table_shard.get(&table.id).copied() {
            Some(shard_id) => shard_id,
            // already off its shard view: an interrupted drop, finish the
            // record deletion and report the table as absent
            None => {
                self.store.delete_table(self.cluster_id, table.id)?;
                topo.tables_by_name.remove(&(schema.id, table_name.to_string()));
                self.bump_generation();
                return Ok(None);
            }
        };

        let view = topo
            .shard_views
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("shard view {}", shard_id)))?;
        let prev_version = view.version;
        let mut updated = view;
        updated.version = prev_version + 1;
        updated.table_ids.retain(|id| *id != table.id);
        if let Err(e) = self
            .store
            .update_shard_view(self.cluster_id, &updated, prev_version)
        {
            self.refresh_shard_view(topo, shard_id);
            return Err(e);
        }
        self.store.delete_table(self.cluster_id, table.id)?;

        topo.shard_views.insert(shard_id, updated.clone());
        topo.table_shard.remove(&table.id);
        topo.tables_by_name.remove(&(schema.id, table_name.to_string()));
        self.bump_generation();
        Ok(Some((
            TableInfo {
                id: table.id,
                name: table.name,
                schema_id: schema.id,
                schema_name: schema.name,
            },
            ShardVersionUpdate {
                shard_id,
                prev_version,
                curr_version: updated.version,
            },
        )))
    }

    /// Make `node_name` the leader of `shard_id` in the cluster view.
    pub fn set_shard_leader(&self, shard_id: ShardId, node_name: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let topo = loaded_mut(&mut inner)?;
        let prev_version = topo.cluster_view.version;
        let mut updated = topo.cluster_view.clone();
        updated
            .shard_nodes
            .retain(|sn| !(sn.shard_id == shard_id && sn.role == ShardRole::Leader));
        updated.shard_nodes.push(ShardNode {
            shard_id,
            role: ShardRole::Leader,
            node_name: node_name.to_string(),
        });
        updated.version = prev_version + 1;
        updated.state = ClusterState::Stable;
        if let Err(e) = self.store.update_cluster_view(&updated, prev_version) {
            self.refresh_cluster_view(topo);
            return Err(e);
        }
        topo.cluster_view = updated;
        self.bump_generation();
        Ok(())
    }

    /// Remove the leader of `shard_id` from the cluster view, returning the
    /// previous leader. During the leaderless window the shard has no owner.
    pub fn remove_shard_leader(&self, shard_id: ShardId) -> Result<Option<String>> {
        let mut inner = self.inner.write().unwrap();
        let topo = loaded_mut(&mut inner)?;
        let old = topo.shard_leader(shard_id);
        if old.is_none() {
            return Ok(None);
        }
        let prev_version = topo.cluster_view.version;
        let mut updated = topo.cluster_view.clone();
        updated
            .shard_nodes
            .retain(|sn| !(sn.shard_id == shard_id && sn.role == ShardRole::Leader));
        updated.version = prev_version + 1;
        if updated.shard_nodes.is_empty() {
            updated.state = ClusterState::Empty;
        }
        if let Err(e) = self.store.update_cluster_view(&updated, prev_version) {
            self.refresh_cluster_view(topo);
            return Err(e);
        }
        topo.cluster_view = updated;
        self.bump_generation();
        Ok(old)
    }

    /// Move `moved` tables out of `source` into a freshly created `target`
    /// shard view. The source is updated first so no table is ever visible in
    /// two shard views.
    pub fn split_shard(
        &self,
        source: ShardId,
        target: ShardId,
        moved: &[TableId],
    ) -> Result<(ShardVersionUpdate, ShardVersionUpdate)> {
        let mut inner = self.inner.write().unwrap();
        let topo = loaded_mut(&mut inner)?;
        let source_view = topo
            .shard_views
            .get(&source)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("shard view {}", source)))?;

        let prev_version = source_view.version;
        let mut updated_source = source_view;
        updated_source.version = prev_version + 1;
        updated_source.table_ids.retain(|id| !moved.contains(id));
        if let Err(e) = self
            .store
            .update_shard_view(self.cluster_id, &updated_source, prev_version)
        {
            self.refresh_shard_view(topo, source);
            return Err(e);
        }

        let target_view = ShardView {
            shard_id: target,
            version: 1,
            table_ids: moved.to_vec(),
            created_at: timestamp_now_millis(),
        };
        match self.store.create_shard_view(self.cluster_id, &target_view) {
            Ok(()) => {}
            // a resumed split already created the target; keep going
            Err(Error::AlreadyExists(_)) => {
                tracing::warn!(shard = %target, "target shard view already exists, resuming split");
            }
            Err(e) => return Err(e),
        }

        topo.shard_views.insert(source, updated_source.clone());
        topo.shard_views.insert(target, target_view.clone());
        for id in moved {
            topo.table_shard.insert(*id, target);
        }
        self.bump_generation();
        Ok((
            ShardVersionUpdate {
                shard_id: source,
                prev_version,
                curr_version: updated_source.version,
            },
            ShardVersionUpdate {
                shard_id: target,
                prev_version: 0,
                curr_version: target_view.version,
            },
        ))
    }

    /// Persist and cache a node record (registration or heartbeat).
    pub fn upsert_node(&self, node: Node) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let topo = loaded_mut(&mut inner)?;
        self.store.create_or_update_node(self.cluster_id, &node)?;
        topo.nodes.insert(node.name.clone(), node);
        self.bump_generation();
        Ok(())
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        let inner = self.inner.read().unwrap();
        let topo = loaded(&inner)?;
        Ok(topo.nodes.values().cloned().collect())
    }

    fn refresh_shard_view(&self, topo: &mut Topology, shard_id: ShardId) {
        match self.store.get_shard_view(self.cluster_id, shard_id) {
            Ok(Some(view)) => {
                topo.table_shard.retain(|_, s| *s != shard_id);
                for id in &view.table_ids {
                    topo.table_shard.insert(*id, shard_id);
                }
                topo.shard_views.insert(shard_id, view);
            }
            Ok(None) => {
                topo.table_shard.retain(|_, s| *s != shard_id);
                topo.shard_views.remove(&shard_id);
            }
            Err(e) => {
                tracing::error!(shard = %shard_id, "failed to reread shard view: {}", e);
            }
        }
    }

    fn refresh_cluster_view(&self, topo: &mut Topology) {
        match self.store.get_cluster_view(self.cluster_id) {
            Ok(Some(view)) => topo.cluster_view = view,
            Ok(None) => {}
            Err(e) => tracing::error!("failed to reread cluster view: {}", e),
        }
    }
}

fn loaded<'a>(inner: &'a std::sync::RwLockReadGuard<'_, Option<Topology>>) -> Result<&'a Topology> {
    inner
        .as_ref()
        .ok_or_else(|| Error::Internal("metadata cache not loaded".into()))
}

fn loaded_mut<'a>(
    inner: &'a mut std::sync::RwLockWriteGuard<'_, Option<Topology>>,
) -> Result<&'a mut Topology> {
    inner
        .as_mut()
        .ok_or_else(|| Error::Internal("metadata cache not loaded".into()))
}
