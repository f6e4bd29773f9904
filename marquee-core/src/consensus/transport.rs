use async_trait::async_trait;
use thiserror::Error;

use super::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use crate::{NodeId, RoomCode};

/// A failed call to a peer. The group treats any of these as the peer
/// being down and lets the next heartbeat drive the retry.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer call timed out")]
    Timeout,
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("peer answered with garbage: {0}")]
    Protocol(String),
}

/// Represents a type that can deliver consensus calls to peer nodes.
///
/// Consensus groups never touch the network themselves; one of these is
/// injected at construction so groups stay testable in isolation.
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        peer: &NodeId,
        room: &RoomCode,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError>;

    async fn append_entries(
        &self,
        peer: &NodeId,
        room: &RoomCode,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError>;
}
