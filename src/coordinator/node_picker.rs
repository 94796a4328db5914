//! Shard placement engine
//!
//! Maps a set of shard ids onto the live nodes with consistent uniform
//! hashing: a ring of virtual points per node, a clockwise walk per shard,
//! and a per-node cap of ceil(shards / nodes) so no node ever exceeds the
//! fair share. The mapping is a pure function of (node set, shard set): the
//! inputs are sorted internally, so ordering never changes the result, and
//! the virtual point count is a process-wide constant.

use crate::cluster::RegisteredNode;
use crate::common::{Error, Result};
use crate::storage::types::ShardId;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Virtual points per node on the ring. Must stay identical across calls
/// within a process so repeated picks agree.
pub const VIRTUAL_POINTS_PER_NODE: usize = 128;

#[derive(Debug, Clone)]
pub struct PickConfig {
    /// The cluster's logical shard count; picking with an empty shard list
    /// places the full range `0..num_total_shards`.
    pub num_total_shards: u32,
    /// Max heartbeat age before a node is excluded from placement.
    pub lease_threshold: Duration,
}

pub struct NodePicker {
    virtual_points: usize,
}

impl NodePicker {
    pub fn new() -> Self {
        Self {
            virtual_points: VIRTUAL_POINTS_PER_NODE,
        }
    }

    /// Place `shard_ids` (or the full range if empty) onto the nodes that are
    /// alive as of `now_ms`.
    pub fn pick(
        &self,
        config: &PickConfig,
        shard_ids: &[ShardId],
        nodes: &[RegisteredNode],
        now_ms: u64,
    ) -> Result<HashMap<ShardId, RegisteredNode>> {
        let mut shards: Vec<ShardId> = if shard_ids.is_empty() {
            (0..config.num_total_shards).map(ShardId).collect()
        } else {
            shard_ids.to_vec()
        };
        shards.sort_unstable();
        shards.dedup();
        if shards.is_empty() {
            return Ok(HashMap::new());
        }

        let lease_ms = config.lease_threshold.as_millis() as u64;
        let mut alive: Vec<&RegisteredNode> = nodes
            .iter()
            .filter(|n| now_ms.saturating_sub(n.node.last_touch_time) <= lease_ms)
            .collect();
        if alive.is_empty() {
            return Err(Error::NoAvailableNodes);
        }
        alive.sort_by(|a, b| a.node.name.cmp(&b.node.name));
        alive.dedup_by(|a, b| a.node.name == b.node.name);

        // ring of virtual points, point hash -> node index
        let mut ring: BTreeMap<u64, usize> = BTreeMap::new();
        for (idx, node) in alive.iter().enumerate() {
            for point in 0..self.virtual_points {
                ring.insert(point_hash(&format!("{}:{}", node.node.name, point)), idx);
            }
        }

        // per-node cap: the ceiling of the fair share, so the caps sum to at
        // least the shard count and a feasible assignment always exists
        let cap = shards.len().div_ceil(alive.len());
        let mut counts = vec![0usize; alive.len()];
        let mut mapping = HashMap::with_capacity(shards.len());

        for shard in shards {
            let h = point_hash(&format!("shard-{}", shard.0));
            let chosen = ring
                .range(h..)
                .chain(ring.range(..h))
                .map(|(_, idx)| *idx)
                .find(|idx| counts[*idx] < cap)
                .ok_or(Error::NoAvailableNodes)?;
            counts[chosen] += 1;
            mapping.insert(shard, alive[chosen].clone());
        }

        Ok(mapping)
    }
}

impl Default for NodePicker {
    fn default() -> Self {
        Self::new()
    }
}

fn point_hash(key: &str) -> u64 {
    let hash = blake3::hash(key.as_bytes());
    u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{Node, NodeState, NodeStats};
    use std::collections::HashMap;

    const NOW_MS: u64 = 1_700_000_000_000;

    fn registered_node(name: &str, last_touch_time: u64) -> RegisteredNode {
        RegisteredNode {
            node: Node {
                name: name.to_string(),
                stats: NodeStats::default(),
                created_at: 0,
                last_touch_time,
                state: NodeState::Online,
            },
            endpoint: name.to_string(),
            shard_infos: vec![],
        }
    }

    fn config(num_total_shards: u32) -> PickConfig {
        PickConfig {
            num_total_shards,
            lease_threshold: Duration::from_secs(15),
        }
    }

    fn fresh_nodes(count: usize) -> Vec<RegisteredNode> {
        (0..count)
            .map(|i| registered_node(&i.to_string(), NOW_MS))
            .collect()
    }

    /// Shards per node name for the given node/shard counts.
    fn alloc_shards(node_count: usize, shard_count: u32) -> HashMap<String, Vec<u32>> {
        let picker = NodePicker::new();
        let nodes = fresh_nodes(node_count);
        let shard_ids: Vec<ShardId> = (0..shard_count).map(ShardId).collect();
        let mapping = picker
            .pick(&config(shard_count), &shard_ids, &nodes, NOW_MS)
            .unwrap();
        let mut by_node: HashMap<String, Vec<u32>> = HashMap::new();
        for (shard, node) in mapping {
            by_node.entry(node.node.name).or_default().push(shard.0);
        }
        by_node
    }

    fn lost_shards(old: &[u32], new: &[u32]) -> Vec<u32> {
        old.iter().copied().filter(|s| !new.contains(s)).collect()
    }

    #[test]
    fn test_pick_no_nodes() {
        let picker = NodePicker::new();
        let err = picker
            .pick(&config(10), &[ShardId(0)], &[], NOW_MS)
            .unwrap_err();
        assert!(matches!(err, Error::NoAvailableNodes));
    }

    #[test]
    fn test_pick_all_nodes_expired() {
        let picker = NodePicker::new();
        let stale = NOW_MS - 60_000;
        let nodes: Vec<RegisteredNode> = (0..3)
            .map(|i| registered_node(&i.to_string(), stale))
            .collect();
        let err = picker
            .pick(&config(10), &[ShardId(0)], &nodes, NOW_MS)
            .unwrap_err();
        assert!(matches!(err, Error::NoAvailableNodes));
    }

    #[test]
    fn test_pick_only_online_node() {
        let picker = NodePicker::new();
        let stale = NOW_MS - 60_000;
        let mut nodes: Vec<RegisteredNode> = (0..3)
            .map(|i| registered_node(&i.to_string(), stale))
            .collect();
        nodes[1].node.last_touch_time = NOW_MS;

        let mapping = picker
            .pick(&config(10), &[ShardId(0)], &nodes, NOW_MS)
            .unwrap();
        assert_eq!(mapping[&ShardId(0)].node.name, "1");
    }

    #[test]
    fn test_every_shard_mapped() {
        let by_node = alloc_shards(3, 10);
        let total: usize = by_node.values().map(|v| v.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_uniformity_baseline() {
        // 30 nodes, 256 shards: no node may exceed ceil(256/30) = 9
        let by_node = alloc_shards(30, 256);
        for (node, shards) in &by_node {
            assert!(
                shards.len() <= 9,
                "node {} got {} shards",
                node,
                shards.len()
            );
        }
    }

    #[test]
    fn test_repeat_pick_is_identical() {
        let first = alloc_shards(30, 256);
        let second = alloc_shards(30, 256);
        for (node, shards) in &first {
            let again = second.get(node).cloned().unwrap_or_default();
            assert!(lost_shards(shards, &again).is_empty());
            assert!(lost_shards(&again, shards).is_empty());
        }
    }

    #[test]
    fn test_determinism_under_input_reordering() {
        let picker = NodePicker::new();
        let nodes = fresh_nodes(10);
        let mut reversed = nodes.clone();
        reversed.reverse();
        let shard_ids: Vec<ShardId> = (0..64).map(ShardId).collect();
        let mut shuffled = shard_ids.clone();
        shuffled.reverse();

        let a = picker
            .pick(&config(64), &shard_ids, &nodes, NOW_MS)
            .unwrap();
        let b = picker
            .pick(&config(64), &shuffled, &reversed, NOW_MS)
            .unwrap();
        for (shard, node) in &a {
            assert_eq!(b[shard].node.name, node.node.name);
        }
    }

    #[test]
    fn test_add_node_minimal_churn() {
        // adding one node must not strip more than a handful of shards from
        // any existing node
        let before = alloc_shards(30, 256);
        let after = alloc_shards(31, 256);
        for (node, shards) in &before {
            let kept = after.get(node).cloned().unwrap_or_default();
            let lost = lost_shards(shards, &kept);
            assert!(
                lost.len() <= 5,
                "node {} lost {} shards: {:?}",
                node,
                lost.len(),
                lost
            );
        }
        for (_, shards) in &after {
            assert!(shards.len() <= 9); // ceil(256/31) = 9
        }
    }

    #[test]
    fn test_add_shard_minimal_churn() {
        let before = alloc_shards(30, 256);
        let after = alloc_shards(30, 257);
        for (node, shards) in &before {
            let kept = after.get(node).cloned().unwrap_or_default();
            let lost = lost_shards(shards, &kept);
            assert!(
                lost.len() <= 5,
                "node {} lost {} shards: {:?}",
                node,
                lost.len(),
                lost
            );
        }
        for (_, shards) in &after {
            assert!(shards.len() <= 9); // ceil(257/30) = 9
        }
    }

    #[test]
    fn test_empty_shard_list_places_full_range() {
        let picker = NodePicker::new();
        let nodes = fresh_nodes(4);
        let mapping = picker.pick(&config(16), &[], &nodes, NOW_MS).unwrap();
        assert_eq!(mapping.len(), 16);
        for shard in 0..16 {
            assert!(mapping.contains_key(&ShardId(shard)));
        }
    }

    #[test]
    fn test_single_node_takes_everything() {
        let picker = NodePicker::new();
        let nodes = fresh_nodes(1);
        let shard_ids: Vec<ShardId> = (0..8).map(ShardId).collect();
        let mapping = picker
            .pick(&config(8), &shard_ids, &nodes, NOW_MS)
            .unwrap();
        assert_eq!(mapping.len(), 8);
        assert!(mapping.values().all(|n| n.node.name == "0"));
    }
}
