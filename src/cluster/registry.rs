//! Node registry
//!
//! Tracks registered data-plane nodes, their last heartbeat and reported
//! shards. Liveness is compared on the monotonic clock; the wall-clock
//! `last_touch_time` on the Node record exists for observability only. A node
//! not heard from for longer than the lease is excluded from placement, but
//! its entry persists until explicit removal.

use crate::cluster::{RegisteredNode, ShardInfo};
use crate::common::timestamp_now_millis;
use crate::storage::types::{Node, NodeState, NodeStats};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    node: Node,
    endpoint: String,
    shard_infos: Vec<ShardInfo>,
    last_touch: Instant,
}

pub struct NodeRegistry {
    lease_threshold: Duration,
    inner: Mutex<HashMap<String, Entry>>,
}

impl NodeRegistry {
    pub fn new(lease_threshold: Duration) -> Self {
        Self {
            lease_threshold,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn lease_threshold(&self) -> Duration {
        self.lease_threshold
    }

    /// Record a heartbeat. Returns the refreshed Node record for durable
    /// persistence by the caller.
    pub fn heartbeat(&self, name: &str, stats: NodeStats, shard_infos: Vec<ShardInfo>) -> Node {
        let mut inner = self.inner.lock().unwrap();
        let now_ms = timestamp_now_millis();
        let entry = inner.entry(name.to_string()).or_insert_with(|| Entry {
            node: Node {
                name: name.to_string(),
                stats: stats.clone(),
                created_at: now_ms,
                last_touch_time: now_ms,
                state: NodeState::Online,
            },
            endpoint: name.to_string(),
            shard_infos: vec![],
            last_touch: Instant::now(),
        });
        entry.node.stats = stats;
        entry.node.last_touch_time = now_ms;
        entry.node.state = NodeState::Online;
        entry.shard_infos = shard_infos;
        entry.last_touch = Instant::now();
        entry.node.clone()
    }

    /// Register a node with an explicit RPC endpoint. An empty endpoint means
    /// the node name is the endpoint.
    pub fn register(&self, name: &str, endpoint: &str, stats: NodeStats) -> Node {
        let node = self.heartbeat(name, stats, vec![]);
        if !endpoint.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            if let Some(entry) = inner.get_mut(name) {
                entry.endpoint = endpoint.to_string();
            }
        }
        node
    }

    pub fn get_endpoint(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.get(name).map(|e| e.endpoint.clone())
    }

    /// Nodes whose last heartbeat is within the lease threshold as of `now`.
    pub fn snapshot_online(&self, now: Instant) -> Vec<RegisteredNode> {
        let inner = self.inner.lock().unwrap();
        inner
            .values()
            .filter(|e| now.saturating_duration_since(e.last_touch) <= self.lease_threshold)
            .map(|e| RegisteredNode {
                node: e.node.clone(),
                endpoint: e.endpoint.clone(),
                shard_infos: e.shard_infos.clone(),
            })
            .collect()
    }

    /// Every known node, online or expired.
    pub fn snapshot_all(&self) -> Vec<RegisteredNode> {
        let inner = self.inner.lock().unwrap();
        inner
            .values()
            .map(|e| RegisteredNode {
                node: e.node.clone(),
                endpoint: e.endpoint.clone(),
                shard_infos: e.shard_infos.clone(),
            })
            .collect()
    }

    pub fn is_online(&self, name: &str, now: Instant) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .get(name)
            .map(|e| now.saturating_duration_since(e.last_touch) <= self.lease_threshold)
            .unwrap_or(false)
    }

    /// Explicit removal; expiry alone never removes a record.
    pub fn remove(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(name);
    }
}
