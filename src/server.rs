//! Coordinator server
//!
//! Wires the topology store, metadata cache, node registry, procedure engine
//! and scheduler together, reacts to leadership transitions, and serves the
//! gRPC and HTTP skins.

use crate::cluster::metadata::RouteResult;
use crate::cluster::{ClusterMetadata, NodeRegistry, ShardInfo};
use crate::common::{Error, MetaConfig, Result};
use crate::coordinator::dispatch::{GrpcDispatch, ShardDispatch};
use crate::coordinator::node_picker::PickConfig;
use crate::coordinator::procedure::{
    CreateTableProcedure, DropTableProcedure, ProcedureContext, ProcedureEngine,
    SplitShardProcedure, TransferLeaderProcedure,
};
use crate::coordinator::Scheduler;
use crate::member::Member;
use crate::service::forward::ForwardClient;
use crate::service::grpc::MetaGrpcService;
use crate::service::http::create_router;
use crate::storage::types::{ClusterId, ClusterView, NodeStats, Schema, ShardId, Table};
use crate::storage::{KvBackend, RocksKv, TopologyStore};
use std::sync::Arc;

const DEFAULT_CLUSTER_ID: ClusterId = ClusterId(1);

pub struct Coordinator {
    config: MetaConfig,
    member: Arc<Member>,
    cluster: Arc<ClusterMetadata>,
    registry: Arc<NodeRegistry>,
    engine: Arc<ProcedureEngine>,
}

impl Coordinator {
    /// Assemble a coordinator over an explicit backing store and dispatcher.
    pub fn with_backend(
        config: MetaConfig,
        kv: Arc<dyn KvBackend>,
        dispatch: Arc<dyn ShardDispatch>,
    ) -> Arc<Self> {
        let store = Arc::new(TopologyStore::new(kv));
        let cluster = Arc::new(ClusterMetadata::new(
            store.clone(),
            DEFAULT_CLUSTER_ID,
            config.cluster.clone(),
        ));
        let registry = Arc::new(NodeRegistry::new(config.cluster.node_lease_threshold()));
        let endpoint = if config.advertise_endpoint.is_empty() {
            config.grpc_addr.to_string()
        } else {
            config.advertise_endpoint.clone()
        };
        let member = Arc::new(Member::new(&config.node_id, &endpoint));
        let engine = Arc::new(ProcedureEngine::new(ProcedureContext {
            cluster: cluster.clone(),
            registry: registry.clone(),
            dispatch,
            store,
            config: config.procedure.clone(),
        }));
        Arc::new(Self {
            config,
            member,
            cluster,
            registry,
            engine,
        })
    }

    /// Assemble a coordinator over RocksDB and the gRPC dispatcher.
    pub fn open(config: MetaConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let kv: Arc<dyn KvBackend> = Arc::new(RocksKv::open(&config.db_path)?);
        let dispatch: Arc<dyn ShardDispatch> =
            Arc::new(GrpcDispatch::new(config.procedure.dispatch_deadline()));
        Ok(Self::with_backend(config, kv, dispatch))
    }

    pub fn member(&self) -> Arc<Member> {
        self.member.clone()
    }

    pub fn cluster(&self) -> Arc<ClusterMetadata> {
        self.cluster.clone()
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        self.registry.clone()
    }

    pub fn engine(&self) -> Arc<ProcedureEngine> {
        self.engine.clone()
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.member.is_leader() {
            return Ok(());
        }
        Err(Error::NotLeader(
            self.member
                .leader_endpoint()
                .unwrap_or_else(|| "unknown".to_string()),
        ))
    }

    // === Operations shared by the gRPC and HTTP skins ===

    pub fn register_node(&self, name: &str, endpoint: &str, stats: NodeStats) -> Result<()> {
        self.ensure_leader()?;
        let node = self.registry.register(name, endpoint, stats);
        self.cluster.upsert_node(node)
    }

    pub fn heartbeat(
        &self,
        name: &str,
        stats: NodeStats,
        shard_infos: Vec<ShardInfo>,
    ) -> Result<()> {
        self.ensure_leader()?;
        let node = self.registry.heartbeat(name, stats, shard_infos);
        self.cluster.upsert_node(node)
    }

    /// Resolve table -> shard -> leader node and its dispatch endpoint.
    pub fn route(&self, schema: &str, table: &str) -> Result<(RouteResult, String)> {
        self.ensure_leader()?;
        let route = self.cluster.route(schema, table)?;
        let endpoint = self
            .registry
            .get_endpoint(&route.leader_node)
            .unwrap_or_else(|| route.leader_node.clone());
        Ok((route, endpoint))
    }

    pub fn create_schema(&self, name: &str) -> Result<Schema> {
        self.ensure_leader()?;
        self.cluster.create_schema(name)
    }

    pub async fn create_table(&self, schema: &str, table: &str) -> Result<(Table, ShardId)> {
        self.ensure_leader()?;
        let id = self.engine.allocate_id()?;
        let procedure = Arc::new(CreateTableProcedure::new(id, schema, table));
        let handle = self.engine.submit(procedure)?;
        handle.wait().await?;
        let created = self
            .cluster
            .get_table(schema, table)?
            .ok_or_else(|| Error::Internal(format!("table {}.{} missing after create", schema, table)))?;
        let shard_id = self
            .cluster
            .shard_of_table(created.id)?
            .ok_or_else(|| Error::Internal(format!("table {} has no shard", created.id)))?;
        Ok((created, shard_id))
    }

    /// Returns whether the table existed before the drop.
    pub async fn drop_table(&self, schema: &str, table: &str) -> Result<bool> {
        self.ensure_leader()?;
        let existed = self.cluster.get_table(schema, table)?.is_some();
        let id = self.engine.allocate_id()?;
        let procedure = Arc::new(DropTableProcedure::new(id, schema, table));
        let handle = self.engine.submit(procedure)?;
        handle.wait().await?;
        Ok(existed)
    }

    pub fn get_cluster_view(&self) -> Result<ClusterView> {
        self.ensure_leader()?;
        self.cluster.get_cluster_view()
    }

    pub async fn transfer_leader(&self, shard_id: ShardId, target_node: &str) -> Result<()> {
        self.ensure_leader()?;
        let id = self.engine.allocate_id()?;
        let procedure = Arc::new(TransferLeaderProcedure::new(id, shard_id, target_node));
        let handle = self.engine.submit(procedure)?;
        handle.wait().await?;
        Ok(())
    }

    pub async fn split_shard(&self, source: ShardId, target: ShardId) -> Result<()> {
        self.ensure_leader()?;
        let id = self.engine.allocate_id()?;
        let procedure = Arc::new(SplitShardProcedure::new(id, source, target));
        let handle = self.engine.submit(procedure)?;
        handle.wait().await?;
        Ok(())
    }

    // === Leadership transitions ===

    /// Load the cache, resume interrupted procedures, start accepting.
    pub async fn on_leader_acquired(&self) -> Result<()> {
        self.cluster.bootstrap()?;
        self.cluster.load()?;
        let resumed = self.engine.recover().await?;
        if resumed > 0 {
            tracing::info!(resumed, "resumed procedures from previous leader");
        }
        self.engine.set_accepting(true);
        Ok(())
    }

    /// Stop accepting starts and drop the cached topology; running procedures
    /// reach their next checkpoint on their own.
    pub fn on_leader_lost(&self) {
        self.engine.set_accepting(false);
        self.cluster.invalidate();
    }

    /// Serve gRPC and HTTP until either exits. Standalone deployments become
    /// leader immediately; an external election feeds `member` otherwise.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        tracing::info!("starting coordinator: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", self.config.http_addr);
        tracing::info!("  gRPC API: {}", self.config.grpc_addr);
        tracing::info!("  cluster: {} ({} shards)", self.config.cluster.name, self.config.cluster.num_total_shards);

        // wire leadership transitions before the first one fires
        let this = self.clone();
        let mut leader_rx = self.member.subscribe();
        tokio::spawn(async move {
            while leader_rx.changed().await.is_ok() {
                let is_leader = *leader_rx.borrow();
                if is_leader {
                    if let Err(e) = this.on_leader_acquired().await {
                        tracing::error!("leader acquisition failed: {}", e);
                    }
                } else {
                    this.on_leader_lost();
                }
            }
        });
        self.member.become_leader();

        let scheduler = Arc::new(Scheduler::new(
            self.config.scheduler.clone(),
            PickConfig {
                num_total_shards: self.config.cluster.num_total_shards,
                lease_threshold: self.config.cluster.node_lease_threshold(),
            },
            self.cluster.clone(),
            self.registry.clone(),
            self.engine.clone(),
            self.member.clone(),
        ));
        let _scheduler_handle = scheduler.start();

        let forward = Arc::new(ForwardClient::new(self.member.clone(), self.config.http_port));
        let http_router = create_router(self.clone(), forward);
        let http_listener = tokio::net::TcpListener::bind(self.config.http_addr).await?;
        let http_server = axum::serve(http_listener, http_router);

        let grpc_service = MetaGrpcService::new(self.clone());
        let grpc_server = tonic::transport::Server::builder()
            .add_service(grpc_service.into_server())
            .serve(self.config.grpc_addr);

        tracing::info!("coordinator ready");

        tokio::select! {
            res = http_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            res = grpc_server => {
                if let Err(e) = res {
                    tracing::error!("gRPC server error: {}", e);
                }
            }
        }

        Ok(())
    }
}
