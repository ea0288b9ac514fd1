//! Peer RPC surface: leader election, log replication and snapshot recovery.

use crate::metrics;
use crate::raft::node::RaftNode;
use crate::raft::pb::raft_service_server::RaftService;
use crate::raft::pb::{AppendRpcs, RecoverySnapshot, Response as RaftResponse, VoteRpc};
use std::sync::Arc;

pub struct RaftServiceSVC {
    node: Arc<RaftNode>,
}

impl RaftServiceSVC {
    pub fn new(node: Arc<RaftNode>) -> Self {
        RaftServiceSVC { node }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn vote(
        &self,
        request: tonic::Request<VoteRpc>,
    ) -> Result<tonic::Response<RaftResponse>, tonic::Status> {
        metrics::record_metrics("vote", || async {
            Ok(tonic::Response::new(self.node.vote(request.into_inner())))
        })
        .await
    }

    async fn append_entries(
        &self,
        request: tonic::Request<AppendRpcs>,
    ) -> Result<tonic::Response<RaftResponse>, tonic::Status> {
        metrics::record_metrics("append_entries", || async {
            Ok(tonic::Response::new(
                self.node.handle_append_rpcs(request.into_inner()).await,
            ))
        })
        .await
    }

    async fn recover(
        &self,
        request: tonic::Request<RecoverySnapshot>,
    ) -> Result<tonic::Response<RaftResponse>, tonic::Status> {
        metrics::record_metrics("recover", || async {
            Ok(tonic::Response::new(
                self.node.handle_recovery_snapshot(request.into_inner()),
            ))
        })
        .await
    }
}
