//! Client RPC surface.

use crate::metrics;
use crate::raft::node::RaftNode;
use pb::kv_service_server::KvService;
use pb::{ClientRequest, ClientResponse};
use std::sync::Arc;

/// Protocol buffer definitions for the client surface.
#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("kv");
}

pub struct KvServiceSVC {
    node: Arc<RaftNode>,
}

impl KvServiceSVC {
    pub fn new(node: Arc<RaftNode>) -> Self {
        KvServiceSVC { node }
    }
}

#[tonic::async_trait]
impl KvService for KvServiceSVC {
    async fn execute(
        &self,
        request: tonic::Request<ClientRequest>,
    ) -> Result<tonic::Response<ClientResponse>, tonic::Status> {
        metrics::record_metrics("execute", || async {
            Ok(tonic::Response::new(
                self.node.handle_client_request(request.into_inner()).await,
            ))
        })
        .await
    }
}
