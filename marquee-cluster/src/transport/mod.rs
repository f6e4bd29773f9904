use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use marquee_core::{
    AppendEntriesArgs, AppendEntriesReply, Config, CreateRoomArgs, HealthReply, NodeId, Operation,
    RaftTransport, RequestVoteArgs, RequestVoteReply, RoomCode, RpcAck, RpcBody, RpcEnvelope,
    TransportError,
};
use serde::de::DeserializeOwned;

use crate::ClusterConfig;

/// The outbound half of the inter-node link.
///
/// Every call posts one envelope to a peer's `/rpc` endpoint and decodes
/// the typed reply. There are no retries in here; consensus heartbeats
/// and the callers own that.
pub struct PeerClient {
    node_id: NodeId,
    peers: HashMap<NodeId, String>,
    http: reqwest::Client,
    sequence: AtomicU64,
}

impl PeerClient {
    pub fn new(config: &ClusterConfig, consensus: &Config) -> Self {
        let peers = config
            .peers()
            .map(|peer| (peer.id.clone(), peer.rpc_url()))
            .collect();

        let http = reqwest::Client::builder()
            .timeout(consensus.rpc_timeout())
            .build()
            .expect("http client builds");

        Self {
            node_id: config.local_id.clone(),
            peers,
            http,
            sequence: AtomicU64::new(1),
        }
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().cloned().collect()
    }

    fn envelope(&self, peer: &NodeId, room: &RoomCode, body: RpcBody) -> RpcEnvelope {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        RpcEnvelope {
            body,
            source_node_id: self.node_id.clone(),
            target_node_id: Some(peer.clone()),
            message_id: format!("{}-{}", self.node_id, sequence),
            room_code: room.clone(),
        }
    }

    async fn call<T>(&self, peer: &NodeId, envelope: RpcEnvelope) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
    {
        let url = self
            .peers
            .get(peer)
            .map(|base| format!("{}/rpc", base))
            .ok_or_else(|| TransportError::Unreachable(format!("unknown peer {}", peer)))?;

        let response = self
            .http
            .post(url)
            .header("content-type", "application/json")
            .body(envelope.encode())
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Unreachable(error.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Protocol(format!(
                "peer answered {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|error| TransportError::Protocol(error.to_string()))
    }

    /// Asks a peer to instantiate a room's consensus group before the
    /// first replication round reaches it. Idempotent on the peer.
    pub async fn create_room(
        &self,
        peer: &NodeId,
        room: &RoomCode,
        args: CreateRoomArgs,
    ) -> Result<RpcAck, TransportError> {
        let envelope = self.envelope(peer, room, RpcBody::CreateRoom(args));

        self.call(peer, envelope).await
    }

    /// Runs the create handshake against every peer.
    ///
    /// Returns whether any reachable peer reported the code as taken; an
    /// unreachable peer only loses the room until it reconnects, which is
    /// the same position it would be in after a crash.
    pub async fn broadcast_create_room(&self, room: &RoomCode, args: CreateRoomArgs) -> bool {
        let mut taken = false;

        for peer in self.peer_ids() {
            match self.create_room(&peer, room, args.clone()).await {
                Ok(ack) if ack.ok => {}
                Ok(_) => taken = true,
                Err(error) => {
                    warn!("Create handshake for {} with {} failed: {}", room, peer, error)
                }
            }
        }

        taken
    }

    /// Hands a client operation to the room's leader for stamping and
    /// proposal.
    pub async fn forward_operation(
        &self,
        peer: &NodeId,
        room: &RoomCode,
        operation: Operation,
    ) -> Result<RpcAck, TransportError> {
        let envelope = self.envelope(peer, room, RpcBody::Forward(operation));

        self.call(peer, envelope).await
    }

    /// Probes a peer's health endpoint and classifies it.
    pub async fn is_reachable(&self, peer: &NodeId) -> bool {
        let Some(base) = self.peers.get(peer) else {
            return false;
        };

        let reply = self
            .http
            .get(format!("{}/health", base))
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match reply {
            Ok(response) => response.json::<HealthReply>().await.is_ok(),
            Err(_) => false,
        }
    }

    /// Logs which peers answer their health endpoint right now.
    pub async fn log_peer_health(&self) {
        for peer in self.peer_ids() {
            if self.is_reachable(&peer).await {
                info!("Peer {} is reachable", peer);
            } else {
                warn!("Peer {} is unreachable", peer);
            }
        }
    }
}

#[async_trait]
impl RaftTransport for PeerClient {
    async fn request_vote(
        &self,
        peer: &NodeId,
        room: &RoomCode,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        let envelope = self.envelope(peer, room, RpcBody::RequestVote(args));

        self.call(peer, envelope).await
    }

    async fn append_entries(
        &self,
        peer: &NodeId,
        room: &RoomCode,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        let envelope = self.envelope(peer, room, RpcBody::AppendEntries(args));

        self.call(peer, envelope).await
    }
}
