//! Leadership boundary
//!
//! The election itself is delegated to the replicated backing store; this
//! module only answers "am I the leader, and who is" and publishes
//! transitions on a watch channel so the server can load the cache, resume
//! procedures and gate the service skins.

use std::sync::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderInfo {
    pub node_id: String,
    /// The leader's advertised RPC endpoint, used for redirects.
    pub endpoint: String,
}

pub struct Member {
    node_id: String,
    endpoint: String,
    leader: Mutex<Option<LeaderInfo>>,
    tx: watch::Sender<bool>,
}

impl Member {
    pub fn new(node_id: &str, endpoint: &str) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            node_id: node_id.to_string(),
            endpoint: endpoint.to_string(),
            leader: Mutex::new(None),
            tx,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        let leader = self.leader.lock().unwrap();
        matches!(&*leader, Some(info) if info.node_id == self.node_id)
    }

    pub fn leader(&self) -> Option<LeaderInfo> {
        self.leader.lock().unwrap().clone()
    }

    /// Endpoint to redirect callers to when this instance is not the leader.
    pub fn leader_endpoint(&self) -> Option<String> {
        self.leader.lock().unwrap().as_ref().map(|l| l.endpoint.clone())
    }

    /// Subscribe to leadership transitions of this instance.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn become_leader(&self) {
        {
            let mut leader = self.leader.lock().unwrap();
            *leader = Some(LeaderInfo {
                node_id: self.node_id.clone(),
                endpoint: self.endpoint.clone(),
            });
        }
        tracing::info!(node = %self.node_id, "became leader");
        let _ = self.tx.send(true);
    }

    pub fn step_down(&self, new_leader: Option<LeaderInfo>) {
        {
            let mut leader = self.leader.lock().unwrap();
            *leader = new_leader;
        }
        tracing::info!(node = %self.node_id, "stepped down");
        let _ = self.tx.send(false);
    }
}
