//! Split-shard procedure
//!
//! Carves a new shard out of an existing one. Act moves the upper half of the
//! source's tables into a freshly created target shard view (source updated
//! first, so no table is ever in two views). Commit opens the target shard on
//! the source's leader when one exists; placement of a still-unowned target
//! is left to the scheduler.

use crate::cluster::{ShardInfo, UpdateShardInfo};
use crate::common::{Error, Result};
use crate::coordinator::procedure::{
    dispatch_to_node_with_retry, CancelToken, Outcome, Procedure, ProcedureContext,
};
use crate::storage::types::{ProcedureKind, ShardId, ShardRole, TableId};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitShardPayload {
    pub source: ShardId,
    pub target: ShardId,
    pub step: SplitShardStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SplitShardStep {
    Prepare,
    Act { moved: Vec<TableId> },
    Commit { target_version: u64 },
}

pub struct SplitShardProcedure {
    id: u64,
    payload: Mutex<SplitShardPayload>,
}

impl SplitShardProcedure {
    pub fn new(id: u64, source: ShardId, target: ShardId) -> Self {
        Self {
            id,
            payload: Mutex::new(SplitShardPayload {
                source,
                target,
                step: SplitShardStep::Prepare,
            }),
        }
    }

    pub fn from_payload(id: u64, payload: &[u8]) -> Result<Self> {
        let payload: SplitShardPayload = bincode::deserialize(payload)?;
        Ok(Self {
            id,
            payload: Mutex::new(payload),
        })
    }

    fn snapshot(&self) -> SplitShardPayload {
        self.payload.lock().unwrap().clone()
    }

    fn advance(&self, step: SplitShardStep) {
        self.payload.lock().unwrap().step = step;
    }
}

#[tonic::async_trait]
impl Procedure for SplitShardProcedure {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ProcedureKind {
        ProcedureKind::SplitShard
    }

    fn lock_key(&self) -> String {
        let payload = self.payload.lock().unwrap();
        format!("shard:{}", payload.source)
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.snapshot())?)
    }

    async fn run(&self, ctx: &ProcedureContext, cancel: &CancelToken) -> Result<Outcome> {
        loop {
            let payload = self.snapshot();
            match payload.step {
                SplitShardStep::Prepare => {
                    if cancel.is_cancelled() {
                        return Ok(Outcome::Cancelled);
                    }
                    if payload.source == payload.target {
                        return Err(Error::InvalidConfig(
                            "split source and target must differ".into(),
                        ));
                    }
                    let source_view = ctx
                        .cluster
                        .get_shard_view(payload.source)?
                        .ok_or_else(|| Error::NotFound(format!("shard {}", payload.source)))?;
                    if ctx.cluster.get_shard_view(payload.target)?.is_some() {
                        tracing::warn!(
                            source = %payload.source,
                            target = %payload.target,
                            "target shard already exists"
                        );
                        return Ok(Outcome::Finished);
                    }
                    let mut table_ids = source_view.table_ids.clone();
                    table_ids.sort_unstable();
                    let moved = table_ids.split_off(table_ids.len().div_ceil(2));
                    self.advance(SplitShardStep::Act { moved });
                    ctx.checkpoint(self.id, self.kind(), &self.snapshot())?;
                }
                SplitShardStep::Act { moved } => {
                    if cancel.is_cancelled() {
                        return Ok(Outcome::Cancelled);
                    }
                    let (_, target_update) =
                        split_with_stale_retry(ctx, payload.source, payload.target, &moved)?;
                    self.advance(SplitShardStep::Commit {
                        target_version: target_update.curr_version,
                    });
                    ctx.checkpoint(self.id, self.kind(), &self.snapshot())?;
                }
                SplitShardStep::Commit { target_version } => {
                    // colocate the new shard with the source leader; if the
                    // source is unowned the scheduler places the target later
                    let leader = match ctx.cluster.shard_leader(payload.source)? {
                        Some(leader) => leader,
                        None => return Ok(Outcome::Finished),
                    };
                    let fence = UpdateShardInfo {
                        curr_shard_info: ShardInfo {
                            shard_id: payload.target,
                            role: ShardRole::Leader,
                            version: target_version,
                        },
                        prev_version: target_version,
                    };
                    let endpoint = ctx.node_endpoint(&leader);
                    let dispatch = ctx.dispatch.clone();
                    dispatch_to_node_with_retry(ctx, &endpoint, |endpoint| {
                        let dispatch = dispatch.clone();
                        let fence = fence.clone();
                        async move { dispatch.open_shard(&endpoint, fence).await }
                    })
                    .await?;
                    set_leader_with_stale_retry(ctx, payload.target, &leader)?;
                    return Ok(Outcome::Finished);
                }
            }
        }
    }
}

fn split_with_stale_retry(
    ctx: &ProcedureContext,
    source: ShardId,
    target: ShardId,
    moved: &[TableId],
) -> Result<(
    crate::cluster::ShardVersionUpdate,
    crate::cluster::ShardVersionUpdate,
)> {
    let mut attempts = 0;
    loop {
        match ctx.cluster.split_shard(source, target, moved) {
            Ok(updates) => return Ok(updates),
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
