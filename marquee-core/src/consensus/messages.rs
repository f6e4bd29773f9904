use serde::{Deserialize, Serialize};

use super::LogEntry;
use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// On success, the index the follower's log now matches up to.
    /// On failure, the length of the follower's log, as a backtrack hint.
    pub match_index: u64,
}

impl AppendEntriesArgs {
    /// An empty round only carries the leader's term and commit index.
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An incoming consensus message, addressed to one room's group.
#[derive(Debug, Clone, PartialEq)]
pub enum RaftMessage {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
}

/// The reply produced for a [RaftMessage].
#[derive(Debug, Clone, PartialEq)]
pub enum RaftReply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
}
