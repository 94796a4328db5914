//! Drop-table procedure
//!
//! Prepare resolves (schema, table); dropping an absent table finishes
//! immediately. Act removes the table from its shard view under CAS and
//! records the version pair. Commit dispatches `drop_table_on_shard` to the
//! shard leader fenced by that pair; the metadata change stays durable even
//! if dispatch retries are exhausted.

use crate::cluster::{ShardInfo, ShardVersionUpdate, TableInfo, UpdateShardInfo};
use crate::common::{Error, Result};
use crate::coordinator::procedure::{
    dispatch_to_leader_with_retry, CancelToken, Outcome, Procedure, ProcedureContext,
};
use crate::storage::types::{ProcedureKind, ShardRole};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropTablePayload {
    pub schema: String,
    pub table: String,
    pub step: DropTableStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DropTableStep {
    Prepare,
    Commit {
        table: TableInfo,
        update: ShardVersionUpdate,
    },
}

pub struct DropTableProcedure {
    id: u64,
    payload: Mutex<DropTablePayload>,
}

impl DropTableProcedure {
    pub fn new(id: u64, schema: &str, table: &str) -> Self {
        Self {
            id,
            payload: Mutex::new(DropTablePayload {
                schema: schema.to_string(),
                table: table.to_string(),
                step: DropTableStep::Prepare,
            }),
        }
    }

    pub fn from_payload(id: u64, payload: &[u8]) -> Result<Self> {
        let payload: DropTablePayload = bincode::deserialize(payload)?;
        Ok(Self {
            id,
            payload: Mutex::new(payload),
        })
    }

    fn snapshot(&self) -> DropTablePayload {
        self.payload.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl Procedure for DropTableProcedure {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ProcedureKind {
        ProcedureKind::DropTable
    }

    fn lock_key(&self) -> String {
        let payload = self.payload.lock().unwrap();
        format!("table:{}.{}", payload.schema, payload.table)
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.snapshot())?)
    }

    async fn run(&self, ctx: &ProcedureContext, cancel: &CancelToken) -> Result<Outcome> {
        loop {
            let payload = self.snapshot();
            match payload.step {
                DropTableStep::Prepare => {
                    if cancel.is_cancelled() {
                        return Ok(Outcome::Cancelled);
                    }
                    let dropped = act_with_stale_retry(ctx, &payload.schema, &payload.table)?;
                    let (table, update) = match dropped {
                        Some(result) => result,
                        None => {
                            tracing::warn!(
                                schema = %payload.schema,
                                table = %payload.table,
                                "drop of non-existing table"
                            );
                            return Ok(Outcome::Finished);
                        }
                    };
                    {
                        let mut guard = self.payload.lock().unwrap();
                        guard.step = DropTableStep::Commit { table, update };
                    }
                    ctx.checkpoint(self.id, self.kind(), &self.snapshot())?;
                }
                DropTableStep::Commit { table, update } => {
                    let fence = UpdateShardInfo {
                        curr_shard_info: ShardInfo {
                            shard_id: update.shard_id,
                            role: ShardRole::Leader,
                            version: update.curr_version,
                        },
                        prev_version: update.prev_version,
                    };
                    let dispatch = ctx.dispatch.clone();
                    dispatch_to_leader_with_retry(ctx, update.shard_id, |endpoint| {
                        let dispatch = dispatch.clone();
                        let fence = fence.clone();
                        let table = table.clone();
                        async move {
                            dispatch
                                .drop_table_on_shard(&endpoint, fence, table)
                                .await
                        }
                    })
                    .await?;
                    return Ok(Outcome::Finished);
                }
            }
        }
    }
}

/// The metadata mutation, retried locally with a fresh read on StaleVersion.
fn act_with_stale_retry(
    ctx: &ProcedureContext,
    schema: &str,
    table: &str,
) -> Result<Option<(TableInfo, ShardVersionUpdate)>> {
    let mut attempts = 0;
    loop {
        match ctx.cluster.drop_table(schema, table) {
            Ok(result) => return Ok(result),
            Err(Error::StaleVersion { .. }) if attempts < ctx.config.retry_max => {
                attempts += 1;
                tracing::warn!(schema, table, attempts, "stale shard view, rereading");
            }
            Err(e) => return Err(e),
        }
    }
}
