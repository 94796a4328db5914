//! Event dispatcher
//!
//! Stateless facade issuing typed shard commands to data-plane nodes. Every
//! command carries an `UpdateShardInfo` version fence so the recipient can
//! reject out-of-order updates, and every call is bounded by the configured
//! dispatch deadline. Errors are classified so procedures can decide between
//! retry, placement refresh and failure.

use crate::cluster::{TableInfo, UpdateShardInfo};
use crate::common::{Error, Result};
use crate::proto;
use crate::proto::shard_service_client::ShardServiceClient;
use crate::storage::types::ShardRole;
use std::collections::HashMap;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

#[tonic::async_trait]
pub trait ShardDispatch: Send + Sync {
    async fn open_shard(&self, endpoint: &str, update: UpdateShardInfo) -> Result<()>;

    async fn close_shard(&self, endpoint: &str, update: UpdateShardInfo) -> Result<()>;

    async fn create_table_on_shard(
        &self,
        endpoint: &str,
        update: UpdateShardInfo,
        table: TableInfo,
    ) -> Result<()>;

    async fn drop_table_on_shard(
        &self,
        endpoint: &str,
        update: UpdateShardInfo,
        table: TableInfo,
    ) -> Result<()>;
}

/// gRPC dispatcher with a lazy per-endpoint channel cache.
pub struct GrpcDispatch {
    deadline: Duration,
    clients: tokio::sync::Mutex<HashMap<String, ShardServiceClient<Channel>>>,
}

impl GrpcDispatch {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, endpoint: &str) -> Result<ShardServiceClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(endpoint) {
            return Ok(client.clone());
        }
        let uri = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        };
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| Error::Fatal(format!("bad endpoint {}: {}", endpoint, e)))?
            .connect_timeout(self.deadline)
            .timeout(self.deadline)
            .connect()
            .await
            .map_err(|e| Error::Network(format!("connect {}: {}", endpoint, e)))?;
        let client = ShardServiceClient::new(channel);
        clients.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }

    async fn evict(&self, endpoint: &str) {
        let mut clients = self.clients.lock().await;
        clients.remove(endpoint);
    }

    fn finish(
        &self,
        endpoint: &str,
        update: &UpdateShardInfo,
        response: std::result::Result<tonic::Response<proto::ShardOpResponse>, tonic::Status>,
    ) -> Result<()> {
        match response {
            Ok(resp) => check_response(endpoint, update, resp.into_inner()),
            Err(status) => Err(classify_status(status)),
        }
    }
}

#[tonic::async_trait]
impl ShardDispatch for GrpcDispatch {
    async fn open_shard(&self, endpoint: &str, update: UpdateShardInfo) -> Result<()> {
        let mut client = self.client(endpoint).await?;
        let request = proto::OpenShardRequest {
            update_shard_info: Some(update_to_pb(&update)),
        };
        let result = self.finish(endpoint, &update, client.open_shard(request).await);
        if matches!(result, Err(Error::Network(_))) {
            self.evict(endpoint).await;
        }
        result
    }

    async fn close_shard(&self, endpoint: &str, update: UpdateShardInfo) -> Result<()> {
        let mut client = self.client(endpoint).await?;
        let request = proto::CloseShardRequest {
            update_shard_info: Some(update_to_pb(&update)),
        };
        let result = self.finish(endpoint, &update, client.close_shard(request).await);
        if matches!(result, Err(Error::Network(_))) {
            self.evict(endpoint).await;
        }
        result
    }

    async fn create_table_on_shard(
        &self,
        endpoint: &str,
        update: UpdateShardInfo,
        table: TableInfo,
    ) -> Result<()> {
        let mut client = self.client(endpoint).await?;
        let request = proto::CreateTableOnShardRequest {
            update_shard_info: Some(update_to_pb(&update)),
            table_info: Some(table_to_pb(&table)),
        };
        let result = self.finish(endpoint, &update, client.create_table_on_shard(request).await);
        if matches!(result, Err(Error::Network(_))) {
            self.evict(endpoint).await;
        }
        result
    }

    async fn drop_table_on_shard(
        &self,
        endpoint: &str,
        update: UpdateShardInfo,
        table: TableInfo,
    ) -> Result<()> {
        let mut client = self.client(endpoint).await?;
        let request = proto::DropTableOnShardRequest {
            update_shard_info: Some(update_to_pb(&update)),
            table_info: Some(table_to_pb(&table)),
        };
        let result = self.finish(endpoint, &update, client.drop_table_on_shard(request).await);
        if matches!(result, Err(Error::Network(_))) {
            self.evict(endpoint).await;
        }
        result
    }
}

pub fn role_to_pb(role: ShardRole) -> i32 {
    match role {
        ShardRole::Leader => proto::ShardRole::Leader as i32,
        ShardRole::Follower => proto::ShardRole::Follower as i32,
    }
}

pub fn update_to_pb(update: &UpdateShardInfo) -> proto::UpdateShardInfo {
    proto::UpdateShardInfo {
        curr_shard_info: Some(proto::ShardInfo {
            shard_id: update.curr_shard_info.shard_id.0,
            role: role_to_pb(update.curr_shard_info.role),
            version: update.curr_shard_info.version,
        }),
        prev_version: update.prev_version,
    }
}

pub fn table_to_pb(table: &TableInfo) -> proto::TableInfo {
    proto::TableInfo {
        id: table.id.0,
        name: table.name.clone(),
        schema_id: table.schema_id.0,
        schema_name: table.schema_name.clone(),
    }
}

// error_code values of ShardOpResponse, shared with the data plane
const CODE_STALE_SHARD_VERSION: u32 = 1;
const CODE_NOT_SHARD_LEADER: u32 = 2;
const CODE_BAD_REQUEST: u32 = 3;

fn check_response(
    endpoint: &str,
    update: &UpdateShardInfo,
    resp: proto::ShardOpResponse,
) -> Result<()> {
    if resp.ok {
        return Ok(());
    }
    let shard_id = update.curr_shard_info.shard_id.0;
    match resp.error_code {
        CODE_STALE_SHARD_VERSION => Err(Error::StaleShardVersion {
            shard_id,
            sent: update.prev_version,
        }),
        CODE_NOT_SHARD_LEADER => Err(Error::NotShardLeader {
            node: endpoint.to_string(),
            shard_id,
        }),
        CODE_BAD_REQUEST => Err(Error::Fatal(resp.message)),
        _ => Err(Error::Network(resp.message)),
    }
}

fn classify_status(status: tonic::Status) -> Error {
    use tonic::Code;
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Unknown => {
            Error::Network(status.to_string())
        }
        Code::InvalidArgument | Code::Internal => Error::Fatal(status.to_string()),
        _ => Error::Network(status.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ShardInfo;
    use crate::storage::types::{ShardId, TableId};

    fn sample_update() -> UpdateShardInfo {
        UpdateShardInfo {
            curr_shard_info: ShardInfo {
                shard_id: ShardId(7),
                role: ShardRole::Leader,
                version: 4,
            },
            prev_version: 3,
        }
    }

    #[test]
    fn test_update_to_pb() {
        let pb = update_to_pb(&sample_update());
        let info = pb.curr_shard_info.unwrap();
        assert_eq!(info.shard_id, 7);
        assert_eq!(info.role, proto::ShardRole::Leader as i32);
        assert_eq!(info.version, 4);
        assert_eq!(pb.prev_version, 3);
    }

    #[test]
    fn test_table_to_pb() {
        let table = TableInfo {
            id: TableId(42),
            name: "cpu".to_string(),
            schema_id: crate::storage::types::SchemaId(2),
            schema_name: "public".to_string(),
        };
        let pb = table_to_pb(&table);
        assert_eq!(pb.id, 42);
        assert_eq!(pb.schema_name, "public");
    }

    #[test]
    fn test_response_classification() {
        let update = sample_update();
        let ok = proto::ShardOpResponse {
            ok: true,
            error_code: 0,
            message: String::new(),
        };
        assert!(check_response("n1", &update, ok).is_ok());

        let stale = proto::ShardOpResponse {
            ok: false,
            error_code: CODE_STALE_SHARD_VERSION,
            message: "stale".to_string(),
        };
        match check_response("n1", &update, stale).unwrap_err() {
            Error::StaleShardVersion { shard_id: 7, sent: 3 } => {}
            other => panic!("unexpected: {:?}", other),
        }

        let not_leader = proto::ShardOpResponse {
            ok: false,
            error_code: CODE_NOT_SHARD_LEADER,
            message: "moved".to_string(),
        };
        assert!(matches!(
            check_response("n1", &update, not_leader).unwrap_err(),
            Error::NotShardLeader { .. }
        ));

        let bad = proto::ShardOpResponse {
            ok: false,
            error_code: CODE_BAD_REQUEST,
            message: "corrupt".to_string(),
        };
        assert!(matches!(
            check_response("n1", &update, bad).unwrap_err(),
            Error::Fatal(_)
        ));
    }

    #[test]
    fn test_status_classification() {
        let network = classify_status(tonic::Status::unavailable("down"));
        assert!(network.is_retryable());
        let fatal = classify_status(tonic::Status::invalid_argument("bad"));
        assert!(!fatal.is_retryable());
    }
}
