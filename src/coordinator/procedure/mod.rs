//! Procedure engine
//!
//! A procedure is a named, idempotent, resumable multi-step cluster mutation.
//! Each kind is an explicit prepare -> act -> commit machine; the shared
//! envelope is Init -> Running -> {Finished, Failed, Cancelled}. Progress is
//! persisted after every step so a re-elected leader can resume, and the
//! terminal state is durable before the completion handle fires. A keyed
//! mutex gives at-most-one running procedure per entity; submissions flow
//! through a bounded queue.

pub mod create_table;
pub mod drop_table;
pub mod split_shard;
pub mod transfer_leader;

pub use create_table::CreateTableProcedure;
pub use drop_table::DropTableProcedure;
pub use split_shard::SplitShardProcedure;
pub use transfer_leader::TransferLeaderProcedure;

use crate::cluster::{ClusterMetadata, NodeRegistry};
use crate::common::config::ProcedureConfig;
use crate::common::{timestamp_now_millis, Error, Result};
use crate::coordinator::dispatch::ShardDispatch;
use crate::storage::types::{ProcedureKind, ProcedureRecord, ProcedureState, ShardId};
use crate::storage::TopologyStore;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

const ID_KIND_PROCEDURE: &str = "procedure";

/// The narrow capabilities a procedure is constructed with: read and mutate
/// topology, resolve nodes, dispatch shard commands, persist its own
/// progress. No back-pointer to the engine.
#[derive(Clone)]
pub struct ProcedureContext {
    pub cluster: Arc<ClusterMetadata>,
    pub registry: Arc<NodeRegistry>,
    pub dispatch: Arc<dyn ShardDispatch>,
    pub store: Arc<TopologyStore>,
    pub config: ProcedureConfig,
}

impl ProcedureContext {
    /// Persist kind-specific progress under the procedure's durable record.
    pub fn checkpoint<P: Serialize>(
        &self,
        id: u64,
        kind: ProcedureKind,
        payload: &P,
    ) -> Result<()> {
        let cluster_id = self.cluster.cluster_id();
        let now = timestamp_now_millis();
        let mut record = self
            .store
            .get_procedure(cluster_id, id)?
            .unwrap_or(ProcedureRecord {
                id,
                kind,
                state: ProcedureState::Running,
                payload: vec![],
                created_at: now,
                updated_at: now,
            });
        record.payload = bincode::serialize(payload)?;
        record.updated_at = now;
        self.store.save_procedure(cluster_id, &record)
    }

    /// Dispatch endpoint of a shard's current leader.
    pub fn shard_leader_endpoint(&self, shard_id: ShardId) -> Result<String> {
        let leader = self
            .cluster
            .shard_leader(shard_id)?
            .ok_or(Error::ShardLeaderNotFound(shard_id.0))?;
        Ok(self.registry.get_endpoint(&leader).unwrap_or(leader))
    }

    /// Dispatch endpoint of a registered node, defaulting to its name.
    pub fn node_endpoint(&self, node: &str) -> String {
        self.registry
            .get_endpoint(node)
            .unwrap_or_else(|| node.to_string())
    }
}

/// Cooperative cancellation, checked at step boundaries. A cancel that
/// arrives after the metadata mutation has committed does not unwind it; the
/// procedure runs its commit step to completion.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Cancelled,
}

#[tonic::async_trait]
pub trait Procedure: Send + Sync {
    fn id(&self) -> u64;

    fn kind(&self) -> ProcedureKind;

    /// Key the engine serializes on; the entity being mutated.
    fn lock_key(&self) -> String;

    /// Snapshot of the kind-specific payload for the initial durable record.
    fn encode_payload(&self) -> Result<Vec<u8>>;

    async fn run(&self, ctx: &ProcedureContext, cancel: &CancelToken) -> Result<Outcome>;
}

/// Awaitable completion handle for a submitted procedure.
pub struct ProcedureHandle {
    id: u64,
    rx: oneshot::Receiver<Result<Outcome>>,
}

impl ProcedureHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(self) -> Result<Outcome> {
        self.rx
            .await
            .map_err(|_| Error::Internal("procedure worker dropped".into()))?
    }
}

struct Job {
    procedure: Arc<dyn Procedure>,
    cancel: CancelToken,
    done: oneshot::Sender<Result<Outcome>>,
}

#[derive(Default)]
struct Counters {
    finished: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn record(&self, state: ProcedureState) {
        match state {
            ProcedureState::Finished => self.finished.fetch_add(1, Ordering::Relaxed),
            ProcedureState::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
            ProcedureState::Cancelled => self.cancelled.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }
}

/// Terminal-state counts since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcedureCounters {
    pub finished: u64,
    pub failed: u64,
    pub cancelled: u64,
}

pub struct ProcedureEngine {
    ctx: ProcedureContext,
    locks: Arc<Mutex<HashSet<String>>>,
    cancels: Arc<Mutex<HashMap<u64, CancelToken>>>,
    counters: Arc<Counters>,
    tx: mpsc::Sender<Job>,
    accepting: Arc<AtomicBool>,
}

impl ProcedureEngine {
    pub fn new(ctx: ProcedureContext) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(ctx.config.queue_capacity);
        let locks: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let cancels: Arc<Mutex<HashMap<u64, CancelToken>>> = Arc::new(Mutex::new(HashMap::new()));
        let counters: Arc<Counters> = Arc::new(Counters::default());

        let worker_ctx = ctx.clone();
        let worker_locks = locks.clone();
        let worker_cancels = cancels.clone();
        let worker_counters = counters.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let ctx = worker_ctx.clone();
                let locks = worker_locks.clone();
                let cancels = worker_cancels.clone();
                let counters = worker_counters.clone();
                tokio::spawn(async move {
                    run_job(ctx, locks, cancels, counters, job).await;
                });
            }
        });

        Self {
            ctx,
            locks,
            cancels,
            counters,
            tx,
            accepting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn counters(&self) -> ProcedureCounters {
        ProcedureCounters {
            finished: self.counters.finished.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Allocate a monotonic procedure id from the store.
    pub fn allocate_id(&self) -> Result<u64> {
        self.ctx
            .store
            .alloc_id(self.ctx.cluster.cluster_id(), ID_KIND_PROCEDURE)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Start a procedure. Fails with `Busy` if one with the same lock key is
    /// already running, `QueueFull` if the submission queue is at capacity,
    /// `NotLeader` if this instance stopped accepting starts.
    pub fn submit(&self, procedure: Arc<dyn Procedure>) -> Result<ProcedureHandle> {
        if !self.is_accepting() {
            return Err(Error::NotLeader("unknown".into()));
        }
        let key = procedure.lock_key();
        {
            let mut locks = self.locks.lock().unwrap();
            if !locks.insert(key.clone()) {
                return Err(Error::Busy(key));
            }
        }

        let id = procedure.id();
        let kind = procedure.kind();
        let now = timestamp_now_millis();
        let record = ProcedureRecord {
            id,
            kind,
            state: ProcedureState::Running,
            payload: match procedure.encode_payload() {
                Ok(p) => p,
                Err(e) => {
                    self.locks.lock().unwrap().remove(&key);
                    return Err(e);
                }
            },
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self
            .ctx
            .store
            .save_procedure(self.ctx.cluster.cluster_id(), &record)
        {
            self.locks.lock().unwrap().remove(&key);
            return Err(e);
        }

        let cancel = CancelToken::default();
        let (done, rx) = oneshot::channel();
        let job = Job {
            procedure,
            cancel: cancel.clone(),
            done,
        };
        if self.tx.try_send(job).is_err() {
            self.locks.lock().unwrap().remove(&key);
            let _ = mark_state(&self.ctx, id, kind, ProcedureState::Failed);
            return Err(Error::QueueFull);
        }
        self.cancels.lock().unwrap().insert(id, cancel);
        tracing::info!(procedure = id, kind = %kind, "procedure submitted");
        Ok(ProcedureHandle { id, rx })
    }

    /// Request cancellation of a running procedure.
    pub fn cancel(&self, id: u64) -> bool {
        let cancels = self.cancels.lock().unwrap();
        match cancels.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Resume procedures left in Running state by a previous leader. Each is
    /// re-executed through its idempotent steps; returns how many were
    /// resumed. Called on leadership acquisition, before accepting new
    /// starts.
    pub async fn recover(&self) -> Result<usize> {
        let cluster_id = self.ctx.cluster.cluster_id();
        let records = self.ctx.store.list_procedures(cluster_id)?;
        let mut resumed = 0;
        for record in records {
            if record.state != ProcedureState::Running {
                continue;
            }
            let procedure = match rebuild(&record) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(procedure = record.id, "cannot rebuild procedure: {}", e);
                    let _ = mark_state(&self.ctx, record.id, record.kind, ProcedureState::Failed);
                    continue;
                }
            };
            let key = procedure.lock_key();
            {
                let mut locks = self.locks.lock().unwrap();
                if !locks.insert(key.clone()) {
                    tracing::warn!(procedure = record.id, key = %key, "lock held, skipping resume");
                    continue;
                }
            }
            tracing::info!(procedure = record.id, kind = %record.kind, "resuming procedure");
            let result = procedure.run(&self.ctx, &CancelToken::default()).await;
            let state = terminal_state(&result);
            if let Err(e) = mark_state(&self.ctx, record.id, record.kind, state) {
                tracing::error!(procedure = record.id, "persist terminal state failed: {}", e);
            }
            self.counters.record(state);
            self.locks.lock().unwrap().remove(&key);
            if let Err(e) = result {
                tracing::warn!(procedure = record.id, "resumed procedure failed: {}", e);
            }
            resumed += 1;
        }
        Ok(resumed)
    }
}

fn terminal_state(result: &Result<Outcome>) -> ProcedureState {
    match result {
        Ok(Outcome::Finished) => ProcedureState::Finished,
        Ok(Outcome::Cancelled) => ProcedureState::Cancelled,
        Err(_) => ProcedureState::Failed,
    }
}

async fn run_job(
    ctx: ProcedureContext,
    locks: Arc<Mutex<HashSet<String>>>,
    cancels: Arc<Mutex<HashMap<u64, CancelToken>>>,
    counters: Arc<Counters>,
    job: Job,
) {
    let id = job.procedure.id();
    let kind = job.procedure.kind();
    let key = job.procedure.lock_key();

    let result = job.procedure.run(&ctx, &job.cancel).await;
    let state = terminal_state(&result);
    // terminal state must be durable before the handle observes completion
    if let Err(e) = mark_state(&ctx, id, kind, state) {
        tracing::error!(procedure = id, "persist terminal state failed: {}", e);
    }
    counters.record(state);
    match &result {
        Ok(outcome) => tracing::info!(procedure = id, kind = %kind, "procedure {:?}", outcome),
        Err(e) => tracing::warn!(procedure = id, kind = %kind, "procedure failed: {}", e),
    }

    locks.lock().unwrap().remove(&key);
    cancels.lock().unwrap().remove(&id);
    let _ = job.done.send(result);
}

fn mark_state(
    ctx: &ProcedureContext,
    id: u64,
    kind: ProcedureKind,
    state: ProcedureState,
) -> Result<()> {
    let cluster_id = ctx.cluster.cluster_id();
    let now = timestamp_now_millis();
    let mut record = ctx.store.get_procedure(cluster_id, id)?.unwrap_or(ProcedureRecord {
        id,
        kind,
        state: ProcedureState::Running,
        payload: vec![],
        created_at: now,
        updated_at: now,
    });
    record.state = state;
    record.updated_at = now;
    ctx.store.save_procedure(cluster_id, &record)
}

fn rebuild(record: &ProcedureRecord) -> Result<Arc<dyn Procedure>> {
    Ok(match record.kind {
        ProcedureKind::CreateTable => {
            Arc::new(CreateTableProcedure::from_payload(record.id, &record.payload)?)
        }
        ProcedureKind::DropTable => {
            Arc::new(DropTableProcedure::from_payload(record.id, &record.payload)?)
        }
        ProcedureKind::TransferLeader => Arc::new(TransferLeaderProcedure::from_payload(
            record.id,
            &record.payload,
        )?),
        ProcedureKind::SplitShard => {
            Arc::new(SplitShardProcedure::from_payload(record.id, &record.payload)?)
        }
    })
}

/// Run a shard-leader dispatch with bounded retries. The leader endpoint is
/// re-resolved on every attempt so a placement refresh is picked up after
/// `NotShardLeader`.
pub(crate) async fn dispatch_to_leader_with_retry<F, Fut>(
    ctx: &ProcedureContext,
    shard_id: ShardId,
    mut call: F,
) -> Result<()>
where
    F: FnMut(String) -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
{
    let mut delay = ctx.config.retry_backoff();
    for attempt in 0..ctx.config.retry_max {
        let endpoint = ctx.shard_leader_endpoint(shard_id)?;
        match call(endpoint).await {
            Ok(()) => return Ok(()),
            Err(e)
                if (e.is_retryable() || matches!(e, Error::NotShardLeader { .. }))
                    && attempt + 1 < ctx.config.retry_max =>
            {
                tracing::warn!(
                    shard = %shard_id,
                    attempt = attempt + 1,
                    "dispatch failed: {}, retrying in {:?}",
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Internal("dispatch retries exhausted".into()))
}

/// Same retry loop against a fixed endpoint.
pub(crate) async fn dispatch_to_node_with_retry<F, Fut>(
    ctx: &ProcedureContext,
    endpoint: &str,
    mut call: F,
) -> Result<()>
where
    F: FnMut(String) -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
{
    let mut delay = ctx.config.retry_backoff();
    for attempt in 0..ctx.config.retry_max {
        match call(endpoint.to_string()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt + 1 < ctx.config.retry_max => {
                tracing::warn!(
                    endpoint,
                    attempt = attempt + 1,
                    "dispatch failed: {}, retrying in {:?}",
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Internal("dispatch retries exhausted".into()))
}
