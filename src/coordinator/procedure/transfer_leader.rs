//! Transfer-leader procedure
//!
//! Moves shard leadership to a target node. Act removes the old leader from
//! the cluster view (the shard is leaderless for the duration) and tells the
//! old node to close the shard. Commit opens the shard on the target first
//! and only then records it as leader, so a failed open leaves the shard
//! leaderless and the scheduler re-enqueues the transfer on its next tick.

use crate::cluster::{ShardInfo, UpdateShardInfo};
use crate::common::{Error, Result};
use crate::coordinator::procedure::{
    dispatch_to_node_with_retry, CancelToken, Outcome, Procedure, ProcedureContext,
};
use crate::storage::types::{ProcedureKind, ShardId, ShardRole};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferLeaderPayload {
    pub shard_id: ShardId,
    pub target_node: String,
    pub step: TransferLeaderStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferLeaderStep {
    Prepare,
    CloseOld,
    OpenNew,
}

pub struct TransferLeaderProcedure {
    id: u64,
    payload: Mutex<TransferLeaderPayload>,
}

impl TransferLeaderProcedure {
    pub fn new(id: u64, shard_id: ShardId, target_node: &str) -> Self {
        Self {
            id,
            payload: Mutex::new(TransferLeaderPayload {
                shard_id,
                target_node: target_node.to_string(),
                step: TransferLeaderStep::Prepare,
            }),
        }
    }

    pub fn from_payload(id: u64, payload: &[u8]) -> Result<Self> {
        let payload: TransferLeaderPayload = bincode::deserialize(payload)?;
        Ok(Self {
            id,
            payload: Mutex::new(payload),
        })
    }

    fn snapshot(&self) -> TransferLeaderPayload {
        self.payload.lock().unwrap().clone()
    }

    fn advance(&self, step: TransferLeaderStep) {
        self.payload.lock().unwrap().step = step;
    }
}

#[tonic::async_trait]
impl Procedure for TransferLeaderProcedure {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ProcedureKind {
        ProcedureKind::TransferLeader
    }

    fn lock_key(&self) -> String {
        let payload = self.payload.lock().unwrap();
        format!("shard:{}", payload.shard_id)
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.snapshot())?)
    }

    async fn run(&self, ctx: &ProcedureContext, cancel: &CancelToken) -> Result<Outcome> {
        loop {
            let payload = self.snapshot();
            match payload.step {
                TransferLeaderStep::Prepare => {
                    if cancel.is_cancelled() {
                        return Ok(Outcome::Cancelled);
                    }
                    ctx.cluster
                        .get_shard_view(payload.shard_id)?
                        .ok_or_else(|| Error::NotFound(format!("shard {}", payload.shard_id)))?;
                    if ctx.cluster.shard_leader(payload.shard_id)?.as_deref()
                        == Some(payload.target_node.as_str())
                    {
                        tracing::warn!(
                            shard = %payload.shard_id,
                            node = %payload.target_node,
                            "node already leads shard"
                        );
                        return Ok(Outcome::Finished);
                    }
                    self.advance(TransferLeaderStep::CloseOld);
                    ctx.checkpoint(self.id, self.kind(), &self.snapshot())?;
                }
                TransferLeaderStep::CloseOld => {
                    if cancel.is_cancelled() {
                        return Ok(Outcome::Cancelled);
                    }
                    let old = remove_leader_with_stale_retry(ctx, payload.shard_id)?;
                    if let Some(old_leader) = old {
                        let view = ctx
                            .cluster
                            .get_shard_view(payload.shard_id)?
                            .ok_or_else(|| Error::NotFound(format!("shard {}", payload.shard_id)))?;
                        let fence = UpdateShardInfo {
                            curr_shard_info: ShardInfo {
                                shard_id: payload.shard_id,
                                role: ShardRole::Follower,
                                version: view.version,
                            },
                            prev_version: view.version,
                        };
                        let endpoint = ctx.node_endpoint(&old_leader);
                        // best effort: the old node may already be gone, its
                        // lease expiring is what triggered the transfer
                        if let Err(e) = ctx.dispatch.close_shard(&endpoint, fence).await {
                            tracing::warn!(
                                shard = %payload.shard_id,
                                node = %old_leader,
                                "close shard on old leader failed: {}",
                                e
                            );
                        }
                    }
                    self.advance(TransferLeaderStep::OpenNew);
                    ctx.checkpoint(self.id, self.kind(), &self.snapshot())?;
                }
                TransferLeaderStep::OpenNew => {
                    let view = ctx
                        .cluster
                        .get_shard_view(payload.shard_id)?
                        .ok_or_else(|| Error::NotFound(format!("shard {}", payload.shard_id)))?;
                    let fence = UpdateShardInfo {
                        curr_shard_info: ShardInfo {
                            shard_id: payload.shard_id,
                            role: ShardRole::Leader,
                            version: view.version,
                        },
                        prev_version: view.version,
                    };
                    let endpoint = ctx.node_endpoint(&payload.target_node);
                    let dispatch = ctx.dispatch.clone();
                    dispatch_to_node_with_retry(ctx, &endpoint, |endpoint| {
                        let dispatch = dispatch.clone();
                        let fence = fence.clone();
                        async move { dispatch.open_shard(&endpoint, fence).await }
                    })
                    .await?;
                    set_leader_with_stale_retry(ctx, payload.shard_id, &payload.target_node)?;
                    return Ok(Outcome::Finished);
                }
            }
        }
    }
}

fn remove_leader_with_stale_retry(
    ctx: &ProcedureContext,
    shard_id: ShardId,
) -> Result<Option<String>> {
    let mut attempts = 0;
    loop {
        match ctx.cluster.remove_shard_leader(shard_id) {
            Ok(old) => return Ok(old),
            Err(Error::StaleVersion { .. }) if attempts < ctx.config.retry_max => {
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn set_leader_with_stale_retry(
    ctx: &ProcedureContext,
    shard_id: ShardId,
    node: &str,
) -> Result<()> {
    let mut attempts = 0;
    loop {
        match ctx.cluster.set_shard_leader(shard_id, node) {
            Ok(()) => return Ok(()),
            Err(Error::StaleVersion { .. }) if attempts < ctx.config.retry_max => {
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
