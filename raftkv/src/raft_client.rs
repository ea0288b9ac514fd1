//! Peer connection pool for the raft RPC surface.
//!
//! Connections are dialed lazily and dropped on any transport failure so the
//! next send reconnects. Every call carries the heartbeat timeout; a timeout
//! or transport error yields `None` ("no information") and leaves protocol
//! state untouched.

use crate::raft::node::Options;
use crate::raft::pb::raft_service_client::RaftServiceClient;
use crate::raft::pb::{AppendRpcs, RecoverySnapshot, Response, VoteRpc};
use std::collections::HashMap;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

pub struct RaftClient {
    addresses: Vec<String>,
    heartbeat_timeout: Duration,
    connect_timeout: Duration,
    buffer_size: usize,
    max_message: usize,
    peers: tokio::sync::Mutex<HashMap<u64, RaftServiceClient<Channel>>>,
}

impl RaftClient {
    pub fn new(options: &Options) -> Self {
        RaftClient {
            addresses: options.members.clone(),
            heartbeat_timeout: options.heartbeat_timeout,
            connect_timeout: options.connect_timeout,
            buffer_size: options.buffer_size,
            max_message: options.max_message,
            peers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// A connected client for `peer`, dialing lazily.
    async fn client(&self, peer: u64) -> Option<RaftServiceClient<Channel>> {
        let mut peers = self.peers.lock().await;
        if let Some(client) = peers.get(&peer) {
            return Some(client.clone());
        }
        let endpoint = Endpoint::from_shared(self.addresses[peer as usize].clone())
            .ok()?
            .connect_timeout(self.connect_timeout)
            .buffer_size(self.buffer_size);
        match tokio::time::timeout(self.heartbeat_timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => {
                let client = RaftServiceClient::new(channel)
                    .max_decoding_message_size(self.max_message)
                    .max_encoding_message_size(self.max_message);
                peers.insert(peer, client.clone());
                Some(client)
            }
            _ => {
                log::debug!("failed to connect to peer {}", peer);
                None
            }
        }
    }

    async fn invalidate(&self, peer: u64) {
        self.peers.lock().await.remove(&peer);
    }

    pub async fn vote(&self, peer: u64, rpc: VoteRpc) -> Option<Response> {
        let mut client = self.client(peer).await?;
        match tokio::time::timeout(self.heartbeat_timeout, client.vote(rpc)).await {
            Ok(Ok(response)) => Some(response.into_inner()),
            _ => {
                self.invalidate(peer).await;
                None
            }
        }
    }

    pub async fn append_entries(&self, peer: u64, rpcs: AppendRpcs) -> Option<Response> {
        let mut client = self.client(peer).await?;
        match tokio::time::timeout(self.heartbeat_timeout, client.append_entries(rpcs)).await {
            Ok(Ok(response)) => Some(response.into_inner()),
            _ => {
                self.invalidate(peer).await;
                None
            }
        }
    }

    pub async fn recover(&self, peer: u64, snapshot: RecoverySnapshot) -> Option<Response> {
        let mut client = self.client(peer).await?;
        match tokio::time::timeout(self.heartbeat_timeout, client.recover(snapshot)).await {
            Ok(Ok(response)) => Some(response.into_inner()),
            _ => {
                self.invalidate(peer).await;
                None
            }
        }
    }
}
