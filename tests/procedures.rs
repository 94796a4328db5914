//! Integration tests for the coordination plane: procedures, recovery and
//! the placement scheduler, over an in-memory backing store and a recording
//! dispatcher.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tsmeta::cluster::{TableInfo, UpdateShardInfo};
use tsmeta::common::{Error, MetaConfig};
use tsmeta::coordinator::dispatch::ShardDispatch;
use tsmeta::coordinator::node_picker::PickConfig;
use tsmeta::coordinator::procedure::drop_table::{DropTablePayload, DropTableStep};
use tsmeta::coordinator::procedure::DropTableProcedure;
use tsmeta::coordinator::Scheduler;
use tsmeta::storage::types::{
    NodeStats, ProcedureKind, ProcedureRecord, ProcedureState, ShardId,
};
use tsmeta::storage::{KvBackend, MemKv, TopologyStore};
use tsmeta::Coordinator;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    OpenShard,
    CloseShard,
    CreateTableOnShard,
    DropTableOnShard,
}

#[derive(Debug, Clone)]
struct DispatchCall {
    command: Command,
    endpoint: String,
    shard_id: u32,
    prev_version: u64,
    curr_version: u64,
    table: Option<String>,
}

/// Records every command; can fail the first N calls with a network error
/// and delay every call.
#[derive(Default)]
struct RecordingDispatch {
    calls: Mutex<Vec<DispatchCall>>,
    fail_network_times: AtomicUsize,
    delay_ms: AtomicU64,
}

impl RecordingDispatch {
    fn calls(&self) -> Vec<DispatchCall> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_of(&self, command: Command) -> Vec<DispatchCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.command == command)
            .collect()
    }

    async fn record(
        &self,
        command: Command,
        endpoint: &str,
        update: &UpdateShardInfo,
        table: Option<&TableInfo>,
    ) -> tsmeta::Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self
            .fail_network_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Network("injected failure".into()));
        }
        self.calls.lock().unwrap().push(DispatchCall {
            command,
            endpoint: endpoint.to_string(),
            shard_id: update.curr_shard_info.shard_id.0,
            prev_version: update.prev_version,
            curr_version: update.curr_shard_info.version,
            table: table.map(|t| t.name.clone()),
        });
        Ok(())
    }
}

#[tonic::async_trait]
impl ShardDispatch for RecordingDispatch {
    async fn open_shard(&self, endpoint: &str, update: UpdateShardInfo) -> tsmeta::Result<()> {
        self.record(Command::OpenShard, endpoint, &update, None).await
    }

    async fn close_shard(&self, endpoint: &str, update: UpdateShardInfo) -> tsmeta::Result<()> {
        self.record(Command::CloseShard, endpoint, &update, None).await
    }

    async fn create_table_on_shard(
        &self,
        endpoint: &str,
        update: UpdateShardInfo,
        table: TableInfo,
    ) -> tsmeta::Result<()> {
        self.record(Command::CreateTableOnShard, endpoint, &update, Some(&table))
            .await
    }

    async fn drop_table_on_shard(
        &self,
        endpoint: &str,
        update: UpdateShardInfo,
        table: TableInfo,
    ) -> tsmeta::Result<()> {
        self.record(Command::DropTableOnShard, endpoint, &update, Some(&table))
            .await
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    dispatch: Arc<RecordingDispatch>,
    kv: Arc<MemKv>,
}

impl Harness {
    /// Inspect the same backing store the coordinator writes.
    fn store(&self) -> TopologyStore {
        TopologyStore::new(self.kv.clone() as Arc<dyn KvBackend>)
    }
}

fn test_config(shards: u32) -> MetaConfig {
    let mut config = MetaConfig::default();
    config.cluster.num_total_shards = shards;
    config.procedure.retry_backoff_ms = 1;
    config
}

async fn leader_harness(shards: u32) -> Harness {
    leader_harness_with(Arc::new(MemKv::new()), shards).await
}

async fn leader_harness_with(kv: Arc<MemKv>, shards: u32) -> Harness {
    let dispatch = Arc::new(RecordingDispatch::default());
    let coordinator = Coordinator::with_backend(test_config(shards), kv.clone(), dispatch.clone());
    coordinator.member().become_leader();
    coordinator.on_leader_acquired().await.unwrap();
    Harness {
        coordinator,
        dispatch,
        kv,
    }
}

/// Give every shard a leader so commit dispatches have a destination.
fn assign_all_leaders(harness: &Harness, node: &str, shards: u32) {
    harness
        .coordinator
        .heartbeat(node, NodeStats::default(), vec![])
        .unwrap();
    for shard in 0..shards {
        harness
            .coordinator
            .cluster()
            .set_shard_leader(ShardId(shard), node)
            .unwrap();
    }
}

#[tokio::test]
async fn test_drop_nonexistent_table_is_idempotent_success() {
    let harness = leader_harness(4).await;
    harness.coordinator.create_schema("public").unwrap();

    let versions_before: Vec<u64> = (0..4)
        .map(|s| {
            harness
                .coordinator
                .cluster()
                .get_shard_view(ShardId(s))
                .unwrap()
                .unwrap()
                .version
        })
        .collect();

    let existed = harness.coordinator.drop_table("public", "ghost").await.unwrap();
    assert!(!existed);

    // no shard view version moved and nothing was dispatched
    let versions_after: Vec<u64> = (0..4)
        .map(|s| {
            harness
                .coordinator
                .cluster()
                .get_shard_view(ShardId(s))
                .unwrap()
                .unwrap()
                .version
        })
        .collect();
    assert_eq!(versions_before, versions_after);
    assert!(harness.dispatch.calls().is_empty());

    // the procedure record is durably Finished
    let records = harness.store().list_procedures(harness.coordinator.cluster().cluster_id()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ProcedureKind::DropTable);
    assert_eq!(records[0].state, ProcedureState::Finished);
}

#[tokio::test]
async fn test_drop_table_updates_view_and_dispatches_fenced_command() {
    let harness = leader_harness(8).await;
    assign_all_leaders(&harness, "10.0.0.1:8831", 8);
    harness.coordinator.create_schema("public").unwrap();

    let (table, shard_id) = harness
        .coordinator
        .create_table("public", "cpu")
        .await
        .unwrap();
    let view = harness
        .coordinator
        .cluster()
        .get_shard_view(shard_id)
        .unwrap()
        .unwrap();
    assert_eq!(view.version, 1);
    assert!(view.table_ids.contains(&table.id));

    let creates = harness.dispatch.calls_of(Command::CreateTableOnShard);
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].prev_version, 0);
    assert_eq!(creates[0].curr_version, 1);

    let existed = harness.coordinator.drop_table("public", "cpu").await.unwrap();
    assert!(existed);

    let view = harness
        .coordinator
        .cluster()
        .get_shard_view(shard_id)
        .unwrap()
        .unwrap();
    assert_eq!(view.version, 2);
    assert!(!view.table_ids.contains(&table.id));

    let drops = harness.dispatch.calls_of(Command::DropTableOnShard);
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].shard_id, shard_id.0);
    assert_eq!(drops[0].prev_version, 1);
    assert_eq!(drops[0].curr_version, 2);
    assert_eq!(drops[0].table.as_deref(), Some("cpu"));
    assert_eq!(drops[0].endpoint, "10.0.0.1:8831");
}

#[tokio::test]
async fn test_dispatch_retries_recover_from_transient_failure() {
    let harness = leader_harness(4).await;
    assign_all_leaders(&harness, "n1", 4);
    harness.coordinator.create_schema("public").unwrap();
    harness.coordinator.create_table("public", "mem").await.unwrap();

    // two transient failures, third attempt lands
    harness.dispatch.fail_network_times.store(2, Ordering::SeqCst);
    let existed = harness.coordinator.drop_table("public", "mem").await.unwrap();
    assert!(existed);
    assert_eq!(harness.dispatch.calls_of(Command::DropTableOnShard).len(), 1);
}

#[tokio::test]
async fn test_dispatch_exhaustion_fails_procedure_but_metadata_is_durable() {
    let harness = leader_harness(4).await;
    assign_all_leaders(&harness, "n1", 4);
    harness.coordinator.create_schema("public").unwrap();
    let (table, shard_id) = harness
        .coordinator
        .create_table("public", "disk")
        .await
        .unwrap();

    harness
        .dispatch
        .fail_network_times
        .store(100, Ordering::SeqCst);
    let err = harness.coordinator.drop_table("public", "disk").await.unwrap_err();
    assert!(matches!(err, Error::Network(_)));

    // the metadata mutation survives the failed commit
    let view = harness
        .coordinator
        .cluster()
        .get_shard_view(shard_id)
        .unwrap()
        .unwrap();
    assert!(!view.table_ids.contains(&table.id));

    let records = harness
        .store()
        .list_procedures(harness.coordinator.cluster().cluster_id())
        .unwrap();
    let failed: Vec<&ProcedureRecord> = records
        .iter()
        .filter(|r| r.state == ProcedureState::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn test_second_concurrent_drop_gets_busy() {
    let harness = leader_harness(4).await;
    assign_all_leaders(&harness, "n1", 4);
    harness.coordinator.create_schema("public").unwrap();
    harness.coordinator.create_table("public", "net").await.unwrap();

    harness.dispatch.delay_ms.store(200, Ordering::SeqCst);
    let engine = harness.coordinator.engine();

    let first = engine
        .submit(Arc::new(DropTableProcedure::new(
            engine.allocate_id().unwrap(),
            "public",
            "net",
        )))
        .unwrap();

    let second = engine.submit(Arc::new(DropTableProcedure::new(
        engine.allocate_id().unwrap(),
        "public",
        "net",
    )));
    match second {
        Err(Error::Busy(key)) => assert_eq!(key, "table:public.net"),
        other => panic!("expected Busy, got {:?}", other.map(|h| h.id())),
    }

    first.wait().await.unwrap();

    // after release the same key is lockable again and observes the
    // idempotent no-op path
    let third = engine
        .submit(Arc::new(DropTableProcedure::new(
            engine.allocate_id().unwrap(),
            "public",
            "net",
        )))
        .unwrap();
    third.wait().await.unwrap();
}

#[tokio::test]
async fn test_leader_loss_between_act_and_commit_resumes_to_same_state() {
    let kv = Arc::new(MemKv::new());

    // first leader: performs the metadata mutation, then "crashes" before
    // dispatching commit
    let (info, update, cluster_id) = {
        let harness = leader_harness_with(kv.clone(), 8).await;
        assign_all_leaders(&harness, "10.0.0.9:8831", 8);
        harness.coordinator.create_schema("public").unwrap();
        harness.coordinator.create_table("public", "cpu").await.unwrap();
        harness.dispatch.calls.lock().unwrap().clear();

        let cluster = harness.coordinator.cluster();
        let (info, update) = cluster.drop_table("public", "cpu").unwrap().unwrap();

        // durable Running record pointing at the commit step, exactly what a
        // crash after the checkpoint leaves behind
        let payload = DropTablePayload {
            schema: "public".to_string(),
            table: "cpu".to_string(),
            step: DropTableStep::Commit {
                table: info.clone(),
                update,
            },
        };
        let record = ProcedureRecord {
            id: 99,
            kind: ProcedureKind::DropTable,
            state: ProcedureState::Running,
            payload: bincode::serialize(&payload).unwrap(),
            created_at: 1,
            updated_at: 1,
        };
        harness.store().save_procedure(cluster.cluster_id(), &record).unwrap();
        assert!(harness.dispatch.calls().is_empty());
        (info, update, cluster.cluster_id())
    };

    // new leader over the same store resumes and re-issues the commit
    let harness = leader_harness_with(kv, 8).await;
    let drops = harness.dispatch.calls_of(Command::DropTableOnShard);
    assert_eq!(drops.len(), 1);
    assert_eq!(drops[0].shard_id, update.shard_id.0);
    assert_eq!(drops[0].prev_version, update.prev_version);
    assert_eq!(drops[0].curr_version, update.curr_version);
    assert_eq!(drops[0].table.as_deref(), Some(info.name.as_str()));

    let record = harness.store().get_procedure(cluster_id, 99).unwrap().unwrap();
    assert_eq!(record.state, ProcedureState::Finished);

    // final state identical to the uninterrupted drop
    let view = harness
        .coordinator
        .cluster()
        .get_shard_view(update.shard_id)
        .unwrap()
        .unwrap();
    assert_eq!(view.version, update.curr_version);
    assert!(!view.table_ids.contains(&info.id));
    assert!(harness
        .coordinator
        .cluster()
        .get_table("public", "cpu")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_transfer_leader_closes_old_and_opens_new() {
    let harness = leader_harness(4).await;
    harness
        .coordinator
        .heartbeat("n1", NodeStats::default(), vec![])
        .unwrap();
    harness
        .coordinator
        .heartbeat("n2", NodeStats::default(), vec![])
        .unwrap();
    harness
        .coordinator
        .cluster()
        .set_shard_leader(ShardId(0), "n1")
        .unwrap();

    harness
        .coordinator
        .transfer_leader(ShardId(0), "n2")
        .await
        .unwrap();

    assert_eq!(
        harness
            .coordinator
            .cluster()
            .shard_leader(ShardId(0))
            .unwrap()
            .as_deref(),
        Some("n2")
    );
    let closes = harness.dispatch.calls_of(Command::CloseShard);
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].endpoint, "n1");
    let opens = harness.dispatch.calls_of(Command::OpenShard);
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].endpoint, "n2");
}

#[tokio::test]
async fn test_transfer_to_current_leader_is_idempotent() {
    let harness = leader_harness(4).await;
    harness
        .coordinator
        .heartbeat("n1", NodeStats::default(), vec![])
        .unwrap();
    harness
        .coordinator
        .cluster()
        .set_shard_leader(ShardId(0), "n1")
        .unwrap();
    let version = harness.coordinator.get_cluster_view().unwrap().version;

    harness
        .coordinator
        .transfer_leader(ShardId(0), "n1")
        .await
        .unwrap();

    assert!(harness.dispatch.calls().is_empty());
    assert_eq!(harness.coordinator.get_cluster_view().unwrap().version, version);
}

#[tokio::test]
async fn test_split_shard_moves_tables_and_opens_target() {
    let harness = leader_harness(2).await;
    assign_all_leaders(&harness, "n1", 2);
    harness.coordinator.create_schema("public").unwrap();
    for i in 0..12 {
        harness
            .coordinator
            .create_table("public", &format!("t{}", i))
            .await
            .unwrap();
    }
    let source_tables = harness
        .coordinator
        .cluster()
        .get_shard_view(ShardId(0))
        .unwrap()
        .unwrap()
        .table_ids;
    assert!(source_tables.len() >= 2, "hash placement left shard 0 empty");

    harness
        .coordinator
        .split_shard(ShardId(0), ShardId(2))
        .await
        .unwrap();

    let source = harness
        .coordinator
        .cluster()
        .get_shard_view(ShardId(0))
        .unwrap()
        .unwrap();
    let target = harness
        .coordinator
        .cluster()
        .get_shard_view(ShardId(2))
        .unwrap()
        .unwrap();
    assert!(!target.table_ids.is_empty());
    assert_eq!(
        source.table_ids.len() + target.table_ids.len(),
        source_tables.len()
    );
    for id in &target.table_ids {
        assert!(!source.table_ids.contains(id));
    }
    // colocated with the source leader
    assert_eq!(
        harness
            .coordinator
            .cluster()
            .shard_leader(ShardId(2))
            .unwrap()
            .as_deref(),
        Some("n1")
    );
    let opens = harness.dispatch.calls_of(Command::OpenShard);
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].shard_id, 2);
}

#[tokio::test]
async fn test_scheduler_reconciles_unowned_shards() {
    let harness = leader_harness(4).await;
    for node in ["n1", "n2"] {
        harness
            .coordinator
            .heartbeat(node, NodeStats::default(), vec![])
            .unwrap();
    }

    let scheduler = Arc::new(Scheduler::new(
        harness.coordinator.config().scheduler.clone(),
        PickConfig {
            num_total_shards: 4,
            lease_threshold: Duration::from_secs(15),
        },
        harness.coordinator.cluster(),
        harness.coordinator.registry(),
        harness.coordinator.engine(),
        harness.coordinator.member(),
    ));

    let enqueued = scheduler.reconcile_once().unwrap();
    assert_eq!(enqueued, 4);

    // transfers complete asynchronously; wait until every shard has a leader
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let owned = (0..4)
            .filter(|s| {
                harness
                    .coordinator
                    .cluster()
                    .shard_leader(ShardId(*s))
                    .unwrap()
                    .is_some()
            })
            .count();
        if owned == 4 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "shards still unowned: {}",
            4 - owned
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // placement respects the fair-share cap: ceil(4/2) = 2 per node
    let view = harness.coordinator.get_cluster_view().unwrap();
    for node in ["n1", "n2"] {
        let owned = view
            .shard_nodes
            .iter()
            .filter(|sn| sn.node_name == node)
            .count();
        assert!(owned <= 2);
    }

    // a converged cluster enqueues nothing
    let enqueued = scheduler.reconcile_once().unwrap();
    assert_eq!(enqueued, 0);
}

#[tokio::test]
async fn test_non_leader_refuses_requests() {
    let kv = Arc::new(MemKv::new());
    let dispatch = Arc::new(RecordingDispatch::default());
    let coordinator = Coordinator::with_backend(test_config(4), kv, dispatch);

    match coordinator.create_schema("public") {
        Err(Error::NotLeader(_)) => {}
        other => panic!("expected NotLeader, got {:?}", other),
    }
    match coordinator.get_cluster_view() {
        Err(Error::NotLeader(_)) => {}
        other => panic!("expected NotLeader, got {:?}", other),
    }
}

#[tokio::test]
async fn test_leadership_loss_stops_engine_and_invalidates_cache() {
    let harness = leader_harness(4).await;
    harness.coordinator.create_schema("public").unwrap();

    harness.coordinator.member().step_down(None);
    harness.coordinator.on_leader_lost();

    assert!(!harness.coordinator.cluster().is_loaded());
    let engine = harness.coordinator.engine();
    let result = engine.submit(Arc::new(DropTableProcedure::new(
        engine.allocate_id().unwrap(),
        "public",
        "t",
    )));
    assert!(matches!(result, Err(Error::NotLeader(_))));

    // regaining leadership restores service
    harness.coordinator.member().become_leader();
    harness.coordinator.on_leader_acquired().await.unwrap();
    assert!(harness.coordinator.cluster().is_loaded());
    assert!(harness
        .coordinator
        .cluster()
        .get_schema("public")
        .unwrap()
        .is_some());
}
