//! Cluster coordination plane
//!
//! The coordinator drives cluster-wide mutations:
//! - the node picker maps shards onto live nodes (consistent uniform hashing)
//! - the dispatcher pushes shard commands to data-plane nodes
//! - the procedure engine executes mutations as durable, resumable state
//!   machines
//! - the scheduler reconciles desired placement against the cluster view

pub mod dispatch;
pub mod node_picker;
pub mod procedure;
pub mod scheduler;

pub use dispatch::{GrpcDispatch, ShardDispatch};
pub use node_picker::{NodePicker, PickConfig};
pub use procedure::{ProcedureEngine, ProcedureHandle};
pub use scheduler::Scheduler;
