//! Leader-based replication core: replica state, durable log formats and the
//! protocol operations driving them.

pub mod framed;
pub mod node;
pub mod periodic;
pub mod state;
pub mod storage;
pub mod vote;

/// Generated protobuf types for the peer RPC surface. The same messages are
/// used as the on-disk record format.
#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

use std::io;

/// Unwrap a storage result or terminate the process. A failing disk means the
/// local log can no longer be trusted; another replica takes over.
pub fn fatal<T>(result: io::Result<T>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            log::error!("{}: {}", what, e);
            std::process::exit(1);
        }
    }
}
