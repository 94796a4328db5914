//! Create-table procedure
//!
//! Mirror of drop-table: prepare resolves the schema and short-circuits on an
//! already-present table, act writes the table record and adds it to the
//! target shard view under CAS, commit dispatches `create_table_on_shard` to
//! the shard leader.

use crate::cluster::{ShardInfo, ShardVersionUpdate, TableInfo, UpdateShardInfo};
use crate::common::{Error, Result};
use crate::coordinator::procedure::{
    dispatch_to_leader_with_retry, CancelToken, Outcome, Procedure, ProcedureContext,
};
use crate::storage::types::{ProcedureKind, ShardRole};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTablePayload {
    pub schema: String,
    pub table: String,
    pub step: CreateTableStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CreateTableStep {
    Prepare,
    Commit {
        table: TableInfo,
        update: ShardVersionUpdate,
    },
}

pub struct CreateTableProcedure {
    id: u64,
    payload: Mutex<CreateTablePayload>,
}

impl CreateTableProcedure {
    pub fn new(id: u64, schema: &str, table: &str) -> Self {
        Self {
            id,
            payload: Mutex::new(CreateTablePayload {
                schema: schema.to_string(),
                table: table.to_string(),
                step: CreateTableStep::Prepare,
            }),
        }
    }

    pub fn from_payload(id: u64, payload: &[u8]) -> Result<Self> {
        let payload: CreateTablePayload = bincode::deserialize(payload)?;
        Ok(Self {
            id,
            payload: Mutex::new(payload),
        })
    }

    fn snapshot(&self) -> CreateTablePayload {
        self.payload.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl Procedure for CreateTableProcedure {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> ProcedureKind {
        ProcedureKind::CreateTable
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
                CreateTableStep::Prepare => {
                    if cancel.is_cancelled() {
                        return Ok(Outcome::Cancelled);
                    }
                    let schema = ctx
                        .cluster
                        .get_schema(&payload.schema)?
                        .ok_or_else(|| Error::NotFound(format!("schema {}", payload.schema)))?;

                    let created = act_with_stale_retry(ctx, &payload.schema, &payload.table)?;
                    let (table, update) = match created {
                        (table, Some(update)) => (table, update),
                        (table, None) => {
                            tracing::warn!(
                                schema = %payload.schema,
                                table = %payload.table,
                                id = table.id.0,
                                "create of existing table"
                            );
                            return Ok(Outcome::Finished);
                        }
                    };
                    let info = TableInfo {
                        id: table.id,
                        name: table.name,
                        schema_id: schema.id,
                        schema_name: schema.name,
                    };
                    {
                        let mut guard = self.payload.lock().unwrap();
                        guard.step = CreateTableStep::Commit {
                            table: info,
                            update,
                        };
                    }
                    ctx.checkpoint(self.id, self.kind(), &self.snapshot())?;
                }
                CreateTableStep::Commit { table, update } => {
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
                                .create_table_on_shard(&endpoint, fence, table)
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

fn act_with_stale_retry(
    ctx: &ProcedureContext,
    schema: &str,
    table: &str,
) -> Result<(crate::storage::types::Table, Option<ShardVersionUpdate>)> {
    let mut attempts = 0;
    loop {
        match ctx.cluster.create_table(schema, table) {
            Ok(result) => return Ok(result),
            Err(Error::StaleVersion { .. }) if attempts < ctx.config.retry_max => {
                attempts += 1;
                tracing::warn!(schema, table, attempts, "stale shard view, rereading");
            }
            Err(e) => return Err(e),
        }
    }
}
