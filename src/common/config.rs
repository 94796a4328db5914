//! Configuration for the tsmeta coordinator

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Node ID of this coordinator instance (unique identifier)
    pub node_id: String,

    /// Bind address for the HTTP API
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Bind address for gRPC
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Advertised gRPC endpoint, used by peers to reach this instance
    #[serde(default)]
    pub advertise_endpoint: String,

    /// HTTP port on every coordinator, used when forwarding to the leader
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// RocksDB path for the backing store (single-node deployments)
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Cluster defaults
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Procedure engine settings
    #[serde(default)]
    pub procedure: ProcedureConfig,

    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_http_addr() -> SocketAddr {
    "0.0.0.0:5000".parse().unwrap()
}
fn default_grpc_addr() -> SocketAddr {
    "0.0.0.0:8831".parse().unwrap()
}
fn default_http_port() -> u16 {
    5000
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./meta-data")
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Per-cluster topology defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// Logical shard count, fixed for the lifetime of the cluster
    #[serde(default = "default_num_total_shards")]
    pub num_total_shards: u32,

    /// Minimum node count before the cluster leaves the empty state
    #[serde(default = "default_min_node_count")]
    pub min_node_count: u32,

    /// Replication factor reported to data-plane nodes
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,

    /// Node lease: max heartbeat age before a node is considered offline
    #[serde(default = "default_node_lease")]
    pub node_lease_threshold_ms: u64,
}

fn default_cluster_name() -> String {
    "default".to_string()
}
fn default_num_total_shards() -> u32 {
    256
}
fn default_min_node_count() -> u32 {
    1
}
fn default_replication_factor() -> u32 {
    1
}
fn default_node_lease() -> u64 {
    15_000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            num_total_shards: default_num_total_shards(),
            min_node_count: default_min_node_count(),
            replication_factor: default_replication_factor(),
            node_lease_threshold_ms: default_node_lease(),
        }
    }
}

impl ClusterConfig {
    pub fn node_lease_threshold(&self) -> Duration {
        Duration::from_millis(self.node_lease_threshold_ms)
    }
}

/// Procedure engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureConfig {
    /// Max retry attempts for dispatch failures inside a procedure
    #[serde(default = "default_retry_max")]
    pub retry_max: usize,

    /// Initial backoff between retries
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Deadline for a single dispatch call
    #[serde(default = "default_dispatch_deadline")]
    pub dispatch_deadline_ms: u64,

    /// Submission queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_retry_max() -> usize {
    3
}
fn default_retry_backoff() -> u64 {
    100
}
fn default_dispatch_deadline() -> u64 {
    5_000
}
fn default_queue_capacity() -> usize {
    1_000
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            retry_max: default_retry_max(),
            retry_backoff_ms: default_retry_backoff(),
            dispatch_deadline_ms: default_dispatch_deadline(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl ProcedureConfig {
    pub fn dispatch_deadline(&self) -> Duration {
        Duration::from_millis(self.dispatch_deadline_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Reconcile interval
    #[serde(default = "default_scheduler_interval")]
    pub interval_ms: u64,

    /// Disable the reconcile loop entirely (manual placement)
    #[serde(default)]
    pub disabled: bool,
}

fn default_scheduler_interval() -> u64 {
    5_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_scheduler_interval(),
            disabled: false,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl MetaConfig {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MetaConfig = serde_json::from_str(&content)
            .map_err(|e| crate::Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::Error::Internal(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node_id.is_empty() {
            return Err(crate::Error::InvalidConfig("node_id is required".into()));
        }
        if self.cluster.num_total_shards == 0 {
            return Err(crate::Error::InvalidConfig(
                "num_total_shards must be positive".into(),
            ));
        }
        if self.cluster.node_lease_threshold_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "node_lease_threshold_ms must be positive".into(),
            ));
        }
        if self.procedure.queue_capacity == 0 {
            return Err(crate::Error::InvalidConfig(
                "procedure queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            node_id: "meta-1".to_string(),
            http_addr: default_http_addr(),
            grpc_addr: default_grpc_addr(),
            advertise_endpoint: String::new(),
            http_port: default_http_port(),
            db_path: default_db_path(),
            cluster: ClusterConfig::default(),
            procedure: ProcedureConfig::default(),
            scheduler: SchedulerConfig::default(),
            log_level: default_log_level(),
        }
    }
}
