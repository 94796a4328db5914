//! Placement scheduler
//!
//! Periodically reconciles desired placement (from the node picker) against
//! observed placement (the cluster view) and enqueues a transfer-leader
//! procedure per divergence. Best effort: anything unserviceable this tick is
//! logged and retried on the next one.

use crate::cluster::{ClusterMetadata, NodeRegistry, RegisteredNode};
use crate::common::config::SchedulerConfig;
use crate::common::{timestamp_now_millis, Error, Result};
use crate::coordinator::node_picker::{NodePicker, PickConfig};
use crate::coordinator::procedure::{ProcedureEngine, TransferLeaderProcedure};
use crate::member::Member;
use crate::storage::types::{ClusterView, ShardId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub struct Scheduler {
    config: SchedulerConfig,
    pick_config: PickConfig,
    cluster: Arc<ClusterMetadata>,
    registry: Arc<NodeRegistry>,
    picker: NodePicker,
    engine: Arc<ProcedureEngine>,
    member: Arc<Member>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        pick_config: PickConfig,
        cluster: Arc<ClusterMetadata>,
        registry: Arc<NodeRegistry>,
        engine: Arc<ProcedureEngine>,
        member: Arc<Member>,
    ) -> Self {
        Self {
            config,
            pick_config,
            cluster,
            registry,
            picker: NodePicker::new(),
            engine,
            member,
        }
    }

    /// Spawn the reconcile loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.interval();
        tokio::spawn(async move {
            if self.config.disabled {
                tracing::info!("scheduler disabled by configuration");
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !self.member.is_leader() {
                    continue;
                }
                if let Err(e) = self.reconcile_once() {
                    tracing::warn!("reconcile tick failed: {}", e);
                }
            }
        })
    }

    /// One reconcile pass; enqueued transfers complete asynchronously.
    pub fn reconcile_once(&self) -> Result<usize> {
        let nodes = self.registry.snapshot_online(Instant::now());
        if nodes.is_empty() {
            tracing::debug!("no online nodes, skipping reconcile");
            return Ok(0);
        }

        // all shard views, covering split targets beyond the initial range
        let view = self.cluster.get_cluster_view()?;
        let shard_ids: Vec<ShardId> = {
            let cluster = self.cluster.get_cluster()?;
            let mut ids: Vec<ShardId> = (0..cluster.shard_total).map(ShardId).collect();
            for sn in &view.shard_nodes {
                if !ids.contains(&sn.shard_id) {
                    ids.push(sn.shard_id);
                }
            }
            ids
        };

        let desired = match self.picker.pick(
            &self.pick_config,
            &shard_ids,
            &nodes,
            timestamp_now_millis(),
        ) {
            Ok(mapping) => mapping,
            Err(Error::NoAvailableNodes) => {
                tracing::warn!("no nodes available for placement, retrying next tick");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let divergences = diff_placement(&desired, &view);
        let mut enqueued = 0;
        for (shard_id, target) in divergences {
            let id = match self.engine.allocate_id() {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!("id allocation failed: {}", e);
                    break;
                }
            };
            let procedure = Arc::new(TransferLeaderProcedure::new(id, shard_id, &target));
            match self.engine.submit(procedure) {
                Ok(_handle) => {
                    enqueued += 1;
                    tracing::info!(shard = %shard_id, node = %target, "transfer leader enqueued");
                }
                Err(Error::Busy(_)) => {
                    tracing::debug!(shard = %shard_id, "shard busy, retrying next tick");
                }
                Err(e) => {
                    tracing::warn!(shard = %shard_id, "submit transfer failed: {}", e);
                }
            }
        }
        Ok(enqueued)
    }
}

/// Shards whose desired owner differs from the current cluster-view leader.
pub fn diff_placement(
    desired: &HashMap<ShardId, RegisteredNode>,
    current: &ClusterView,
) -> Vec<(ShardId, String)> {
    let mut out: Vec<(ShardId, String)> = desired
        .iter()
        .filter(|(shard_id, node)| current.leader_of(**shard_id) != Some(node.node.name.as_str()))
        .map(|(shard_id, node)| (*shard_id, node.node.name.clone()))
        .collect();
    out.sort_by_key(|(shard_id, _)| *shard_id);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{
        ClusterId, ClusterState, Node, NodeState, NodeStats, ShardNode, ShardRole,
    };

    fn registered(name: &str) -> RegisteredNode {
        RegisteredNode {
            node: Node {
                name: name.to_string(),
                stats: NodeStats::default(),
                created_at: 0,
                last_touch_time: 0,
                state: NodeState::Online,
            },
            endpoint: name.to_string(),
            shard_infos: vec![],
        }
    }

    fn view(leaders: &[(u32, &str)]) -> ClusterView {
        ClusterView {
            cluster_id: ClusterId(1),
            version: 1,
            state: ClusterState::Stable,
            shard_nodes: leaders
                .iter()
                .map(|(shard, node)| ShardNode {
                    shard_id: ShardId(*shard),
                    role: ShardRole::Leader,
                    node_name: node.to_string(),
                })
                .collect(),
            created_at: 0,
        }
    }

    #[test]
    fn test_diff_placement_converged() {
        let desired = HashMap::from([
            (ShardId(0), registered("n1")),
            (ShardId(1), registered("n2")),
        ]);
        let current = view(&[(0, "n1"), (1, "n2")]);
        assert!(diff_placement(&desired, &current).is_empty());
    }

    #[test]
    fn test_diff_placement_detects_divergence() {
        let desired = HashMap::from([
            (ShardId(0), registered("n1")),
            (ShardId(1), registered("n3")),
            (ShardId(2), registered("n2")),
        ]);
        // shard 1 leads elsewhere, shard 2 has no leader at all
        let current = view(&[(0, "n1"), (1, "n2")]);
        let diverged = diff_placement(&desired, &current);
        assert_eq!(
            diverged,
            vec![
                (ShardId(1), "n3".to_string()),
                (ShardId(2), "n2".to_string())
            ]
        );
    }
}
