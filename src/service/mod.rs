//! Service skins: gRPC, HTTP and leader forwarding

pub mod forward;
pub mod grpc;
pub mod http;
