//! Error types for tsmeta

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Topology Store Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Stale version on {key}: expected {expected}, found {found}")]
    StaleVersion {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("Corrupted record: {0}")]
    Corrupted(String),

    #[error("Store transport error: {0}")]
    Transport(String),

    // === Membership Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    // === Placement Errors ===
    #[error("No available nodes for placement")]
    NoAvailableNodes,

    #[error("Shard leader not found for shard {0}")]
    ShardLeaderNotFound(u32),

    // === Procedure Errors ===
    #[error("Procedure busy on key: {0}")]
    Busy(String),

    #[error("Procedure queue full")]
    QueueFull,

    // === Dispatch Errors ===
    #[error("Network error: {0}")]
    Network(String),

    #[error("Stale shard version on shard {shard_id}: sent {sent}")]
    StaleShardVersion { shard_id: u32, sent: u64 },

    #[error("Node {node} is not the leader of shard {shard_id}")]
    NotShardLeader { node: String, shard_id: u32 },

    #[error("Fatal dispatch error: {0}")]
    Fatal(String),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::StaleShardVersion { .. }
                | Error::Transport(_)
                | Error::Timeout(_)
        )
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self {
            Error::NotFound(_) => tonic::Status::new(Code::NotFound, self.to_string()),
            Error::AlreadyExists(_) => tonic::Status::new(Code::AlreadyExists, self.to_string()),
            Error::NotLeader(leader) => {
                let mut status = tonic::Status::new(Code::FailedPrecondition, self.to_string());
                if let Ok(value) = leader.parse() {
                    status.metadata_mut().insert("leader", value);
                }
                status
            }
            Error::Busy(_) | Error::QueueFull => {
                tonic::Status::new(Code::ResourceExhausted, self.to_string())
            }
            Error::StaleVersion { .. } | Error::StaleShardVersion { .. } => {
                tonic::Status::new(Code::Aborted, self.to_string())
            }
            Error::NoAvailableNodes | Error::ShardLeaderNotFound(_) => {
                tonic::Status::new(Code::Unavailable, self.to_string())
            }
            Error::InvalidConfig(_) | Error::Fatal(_) => {
                tonic::Status::new(Code::InvalidArgument, self.to_string())
            }
            Error::Timeout(_) => tonic::Status::new(Code::DeadlineExceeded, self.to_string()),
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::Busy(_) | Error::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            Error::StaleVersion { .. } | Error::StaleShardVersion { .. } => StatusCode::CONFLICT,
            Error::InvalidConfig(_) | Error::Fatal(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NoAvailableNodes | Error::ShardLeaderNotFound(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupted(e.to_string())
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::Network("conn reset".into()).is_retryable());
        assert!(Error::StaleShardVersion {
            shard_id: 7,
            sent: 3
        }
        .is_retryable());
        assert!(!Error::NotLeader("node-1:2379".into()).is_retryable());
        assert!(!Error::Fatal("bad request".into()).is_retryable());
        assert!(!Error::Busy("table:t".into()).is_retryable());
    }

    #[test]
    fn test_not_leader_carries_endpoint() {
        let status = Error::NotLeader("10.0.0.3:8831".into()).to_grpc_status();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert_eq!(
            status.metadata().get("leader").unwrap().to_str().unwrap(),
            "10.0.0.3:8831"
        );
    }

    #[test]
    fn test_http_status_mapping() {
        use axum::http::StatusCode;
        assert_eq!(
            Error::NotLeader("x".into()).to_http_status(),
            StatusCode::TEMPORARY_REDIRECT
        );
        assert_eq!(
            Error::NoAvailableNodes.to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::Busy("k".into()).to_http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
