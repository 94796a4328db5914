//! # tsmeta
//!
//! Metadata coordinator for a distributed time-series database cluster:
//! - single source of truth for topology (shards, node ownership, tables)
//! - cluster mutations run as durable, resumable procedures over a
//!   replicated key-value backing store
//! - consistent uniform hashing places shards onto live nodes with bounded
//!   per-node load and minimal churn
//! - gRPC for node/client RPC, HTTP for admin, with non-leader forwarding
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │           tsmeta coordinator               │
//! │  metadata cache ── procedure engine        │
//! │       │                │         │         │
//! │  topology store    node picker   │         │
//! │  (replicated KV)   (placement)   │         │
//! └───────────────────────────┬──────┴─────────┘
//!                             │ dispatch (gRPC)
//!        ┌────────────┬───────┴──────┐
//!   ┌────▼─────┐ ┌────▼─────┐ ┌─────▼────┐
//!   │ Node 1   │ │ Node 2   │ │ Node 3   │
//!   │ shards   │ │ shards   │ │ shards   │
//!   └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! tsmeta serve --id meta-1 --http 0.0.0.0:5000 --grpc 0.0.0.0:8831 \
//!   --db ./meta-data --shards 256
//! ```

pub mod cluster;
pub mod common;
pub mod coordinator;
pub mod member;
pub mod server;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use common::{Error, MetaConfig, Result};
pub use server::Coordinator;

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("tsmeta");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
