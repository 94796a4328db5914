//! Inbound gRPC service
//!
//! Thin skin over the coordinator: every handler checks leadership first and
//! maps domain errors to structured statuses; `NotLeader` carries the leader
//! endpoint in response metadata so clients can redirect.

use crate::cluster::ShardInfo;
use crate::proto;
use crate::proto::meta_service_server::{MetaService, MetaServiceServer};
use crate::server::Coordinator;
use crate::storage::types::{NodeStats, ShardId, ShardRole};
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct MetaGrpcService {
    coordinator: Arc<Coordinator>,
}

impl MetaGrpcService {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Converts this service into a gRPC server instance.
    pub fn into_server(self) -> MetaServiceServer<Self> {
        MetaServiceServer::new(self)
    }
}

fn stats_from_pb(stats: Option<proto::NodeStats>) -> NodeStats {
    match stats {
        Some(s) => NodeStats {
            lease: s.lease,
            zone: s.zone,
            node_version: s.node_version,
        },
        None => NodeStats::default(),
    }
}

fn role_from_pb(role: i32) -> ShardRole {
    if role == proto::ShardRole::Leader as i32 {
        ShardRole::Leader
    } else {
        ShardRole::Follower
    }
}

fn shard_infos_from_pb(infos: Vec<proto::ShardInfo>) -> Vec<ShardInfo> {
    infos
        .into_iter()
        .map(|info| ShardInfo {
            shard_id: ShardId(info.shard_id),
            role: role_from_pb(info.role),
            version: info.version,
        })
        .collect()
}

#[tonic::async_trait]
impl MetaService for MetaGrpcService {
    async fn register_node(
        &self,
        req: Request<proto::RegisterNodeRequest>,
    ) -> Result<Response<proto::RegisterNodeResponse>, Status> {
        let req = req.into_inner();
        self.coordinator
            .register_node(&req.name, &req.endpoint, stats_from_pb(req.stats))
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(proto::RegisterNodeResponse { ok: true }))
    }

    async fn heartbeat(
        &self,
        req: Request<proto::HeartbeatRequest>,
    ) -> Result<Response<proto::HeartbeatResponse>, Status> {
        let req = req.into_inner();
        self.coordinator
            .heartbeat(
                &req.name,
                stats_from_pb(req.stats),
                shard_infos_from_pb(req.shard_infos),
            )
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(proto::HeartbeatResponse { ok: true }))
    }

    async fn route(
        &self,
        req: Request<proto::RouteRequest>,
    ) -> Result<Response<proto::RouteResponse>, Status> {
        let req = req.into_inner();
        let (route, endpoint) = self
            .coordinator
            .route(&req.schema, &req.table)
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(proto::RouteResponse {
            shard_id: route.shard_id.0,
            leader_node: route.leader_node,
            endpoint,
        }))
    }

    async fn create_schema(
        &self,
        req: Request<proto::CreateSchemaRequest>,
    ) -> Result<Response<proto::CreateSchemaResponse>, Status> {
        let req = req.into_inner();
        let schema = self
            .coordinator
            .create_schema(&req.name)
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(proto::CreateSchemaResponse {
            schema_id: schema.id.0,
        }))
    }

    async fn create_table(
        &self,
        req: Request<proto::CreateTableRequest>,
    ) -> Result<Response<proto::CreateTableResponse>, Status> {
        let req = req.into_inner();
        let (table, shard_id) = self
            .coordinator
            .create_table(&req.schema, &req.name)
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(proto::CreateTableResponse {
            table_id: table.id.0,
            shard_id: shard_id.0,
        }))
    }

    async fn drop_table(
        &self,
        req: Request<proto::DropTableRequest>,
    ) -> Result<Response<proto::DropTableResponse>, Status> {
        let req = req.into_inner();
        let dropped = self
            .coordinator
            .drop_table(&req.schema, &req.name)
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(proto::DropTableResponse { dropped }))
    }

    async fn get_cluster_view(
        &self,
        _req: Request<proto::GetClusterViewRequest>,
    ) -> Result<Response<proto::GetClusterViewResponse>, Status> {
        let view = self
            .coordinator
            .get_cluster_view()
            .map_err(|e| e.to_grpc_status())?;
        let shard_nodes = view
            .shard_nodes
            .iter()
            .map(|sn| proto::ShardNodePb {
                shard_id: sn.shard_id.0,
                role: crate::coordinator::dispatch::role_to_pb(sn.role),
                node_name: sn.node_name.clone(),
            })
            .collect();
        Ok(Response::new(proto::GetClusterViewResponse {
            version: view.version,
            shard_nodes,
        }))
    }

    async fn transfer_leader(
        &self,
        req: Request<proto::TransferLeaderRequest>,
    ) -> Result<Response<proto::TransferLeaderResponse>, Status> {
        let req = req.into_inner();
        self.coordinator
            .transfer_leader(ShardId(req.shard_id), &req.target_node)
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(proto::TransferLeaderResponse { ok: true }))
    }

    async fn split_shard(
        &self,
        req: Request<proto::SplitShardRequest>,
    ) -> Result<Response<proto::SplitShardResponse>, Status> {
        let req = req.into_inner();
        self.coordinator
            .split_shard(ShardId(req.source_shard_id), ShardId(req.target_shard_id))
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(proto::SplitShardResponse { ok: true }))
    }
}
