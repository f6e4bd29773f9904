use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use super::{
    AppendEntriesArgs, AppendEntriesReply, LogEntry, RaftLog, RaftMessage, RaftReply,
    RaftTransport, RequestVoteArgs, RequestVoteReply, Role, TransportError,
};
use crate::{Config, ConsensusEvent, EventSender, NodeId, Operation, RoomCode, RoomState};

/// A propose that could not be accepted locally.
#[derive(Debug, Error, PartialEq)]
pub enum ProposeError {
    #[error("this node is not the room's leader")]
    NotLeader { leader: Option<NodeId> },
    #[error("the room refuses writes after an apply fault")]
    Poisoned,
    #[error("the room's consensus group has shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("the room's consensus group has shut down")]
    Closed,
}

/// A point-in-time view of a group, for forwarding decisions and tests.
#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub role: Role,
    pub current_term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub poisoned: bool,
}

/// The handle to one room's consensus group.
///
/// The group itself runs as a single task that owns all consensus state
/// and the room state machine; everything here goes through its mailbox,
/// so no lock guards any of it.
#[derive(Debug, Clone)]
pub struct RaftGroup {
    code: RoomCode,
    inbox: mpsc::Sender<GroupEvent>,
}

enum GroupEvent {
    Message {
        message: RaftMessage,
        reply: oneshot::Sender<RaftReply>,
    },
    Propose {
        operation: Operation,
        reply: oneshot::Sender<Result<(), ProposeError>>,
    },
    Snapshot {
        reply: oneshot::Sender<RoomState>,
    },
    Status {
        reply: oneshot::Sender<GroupStatus>,
    },
    VoteReply {
        peer: NodeId,
        term_at_send: u64,
        result: Result<RequestVoteReply, TransportError>,
    },
    AppendReply {
        peer: NodeId,
        term_at_send: u64,
        result: Result<AppendEntriesReply, TransportError>,
    },
    Shutdown,
}

impl RaftGroup {
    /// Spawns the group task for a room. Must be called on a runtime.
    ///
    /// The node that allocates a room seeds itself as the leader of term
    /// one with `bootstrap_as_leader`, so the first propose does not have
    /// to wait out an election; every other node starts as a follower of
    /// term zero and learns of the leader through its first heartbeat.
    pub fn new(
        code: RoomCode,
        node_id: NodeId,
        peers: Vec<NodeId>,
        config: Config,
        transport: Arc<dyn RaftTransport>,
        events: EventSender,
        bootstrap_as_leader: bool,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(256);

        let actor = GroupActor::new(
            code.clone(),
            node_id,
            peers,
            config,
            transport,
            events,
            bootstrap_as_leader,
            inbox_rx,
            inbox_tx.clone(),
        );

        tokio::spawn(actor.run());

        Self {
            code,
            inbox: inbox_tx,
        }
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    /// Hands an incoming consensus message to the group and awaits its reply.
    pub async fn deliver(&self, message: RaftMessage) -> Result<RaftReply, GroupError> {
        let (tx, rx) = oneshot::channel();

        self.inbox
            .send(GroupEvent::Message { message, reply: tx })
            .await
            .map_err(|_| GroupError::Closed)?;

        rx.await.map_err(|_| GroupError::Closed)
    }

    /// Asks the group to append an operation to the replicated log.
    ///
    /// The call resolves once the entry is appended on the leader, not
    /// once it commits; commit is observed through the state fanout.
    pub async fn propose(&self, operation: Operation) -> Result<(), ProposeError> {
        let (tx, rx) = oneshot::channel();

        self.inbox
            .send(GroupEvent::Propose {
                operation,
                reply: tx,
            })
            .await
            .map_err(|_| ProposeError::Closed)?;

        rx.await.map_err(|_| ProposeError::Closed)?
    }

    /// Copies out the group's current room state.
    pub async fn snapshot(&self) -> Result<RoomState, GroupError> {
        let (tx, rx) = oneshot::channel();

        self.inbox
            .send(GroupEvent::Snapshot { reply: tx })
            .await
            .map_err(|_| GroupError::Closed)?;

        rx.await.map_err(|_| GroupError::Closed)
    }

    pub async fn status(&self) -> Result<GroupStatus, GroupError> {
        let (tx, rx) = oneshot::channel();

        self.inbox
            .send(GroupEvent::Status { reply: tx })
            .await
            .map_err(|_| GroupError::Closed)?;

        rx.await.map_err(|_| GroupError::Closed)
    }

    /// Stops the group task. Pending calls resolve as [GroupError::Closed].
    pub fn shutdown(&self) {
        let _ = self.inbox.try_send(GroupEvent::Shutdown);
    }
}

struct GroupActor {
    code: RoomCode,
    node_id: NodeId,
    peers: Vec<NodeId>,
    config: Config,
    transport: Arc<dyn RaftTransport>,
    events: EventSender,

    role: Role,
    current_term: u64,
    voted_for: Option<NodeId>,
    log: RaftLog,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    votes: HashSet<NodeId>,

    state: RoomState,
    poisoned: Option<String>,

    election_deadline: Instant,
    heartbeat_deadline: Instant,
    /// Peers with a replication round in flight; at most one each.
    in_flight: HashSet<NodeId>,
    /// Peers whose next round was requested while one was in flight.
    pending: HashSet<NodeId>,

    inbox: mpsc::Receiver<GroupEvent>,
    self_tx: mpsc::Sender<GroupEvent>,
}

enum Flow {
    Continue,
    Stop,
}

impl GroupActor {
    #[allow(clippy::too_many_arguments)]
    fn new(
        code: RoomCode,
        node_id: NodeId,
        peers: Vec<NodeId>,
        config: Config,
        transport: Arc<dyn RaftTransport>,
        events: EventSender,
        bootstrap_as_leader: bool,
        inbox: mpsc::Receiver<GroupEvent>,
        self_tx: mpsc::Sender<GroupEvent>,
    ) -> Self {
        let now = Instant::now();
        let election_deadline = now + config.random_election_timeout();

        let mut actor = Self {
            state: RoomState::new(code.clone()),
            code,
            node_id,
            peers,
            config,
            transport,
            events,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            poisoned: None,
            election_deadline,
            heartbeat_deadline: now,
            in_flight: HashSet::new(),
            pending: HashSet::new(),
            inbox,
            self_tx,
        };

        if bootstrap_as_leader {
            actor.current_term = 1;
            actor.voted_for = Some(actor.node_id.clone());
            actor.become_leader();
        }

        actor
    }

    async fn run(mut self) {
        trace!("Consensus group for room {} started", self.code);

        loop {
            let deadline = match self.role {
                Role::Leader => self.heartbeat_deadline,
                _ => self.election_deadline,
            };

            tokio::select! {
                received = self.inbox.recv() => match received {
                    None => break,
                    Some(event) => match self.handle_event(event) {
                        Flow::Continue => {}
                        Flow::Stop => break,
                    },
                },
                _ = sleep_until(deadline) => self.on_deadline(),
            }
        }

        trace!("Consensus group for room {} stopped", self.code);
    }

    fn handle_event(&mut self, event: GroupEvent) -> Flow {
        match event {
            GroupEvent::Message { message, reply } => {
                let response = match message {
                    RaftMessage::RequestVote(args) => {
                        RaftReply::RequestVote(self.on_request_vote(args))
                    }
                    RaftMessage::AppendEntries(args) => {
                        RaftReply::AppendEntries(self.on_append_entries(args))
                    }
                };

                let _ = reply.send(response);
            }
            GroupEvent::Propose { operation, reply } => {
                let _ = reply.send(self.on_propose(operation));
            }
            GroupEvent::Snapshot { reply } => {
                let _ = reply.send(self.state.clone());
            }
            GroupEvent::Status { reply } => {
                let _ = reply.send(GroupStatus {
                    role: self.role,
                    current_term: self.current_term,
                    leader_id: self.leader_id.clone(),
                    commit_index: self.commit_index,
                    last_applied: self.last_applied,
                    last_log_index: self.log.last_index(),
                    poisoned: self.poisoned.is_some(),
                });
            }
            GroupEvent::VoteReply {
                peer,
                term_at_send,
                result,
            } => self.on_vote_reply(peer, term_at_send, result),
            GroupEvent::AppendReply {
                peer,
                term_at_send,
                result,
            } => self.on_append_reply(peer, term_at_send, result),
            GroupEvent::Shutdown => return Flow::Stop,
        }

        Flow::Continue
    }

    fn on_deadline(&mut self) {
        match self.role {
            Role::Leader => {
                self.broadcast_append();
                self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval();
            }
            _ => self.start_election(),
        }
    }

    // Vote receiver, per the election rules

    fn on_request_vote(&mut self, args: RequestVoteArgs) -> RequestVoteReply {
        if args.term < self.current_term {
            return RequestVoteReply {
                term: self.current_term,
                vote_granted: false,
            };
        }

        if args.term > self.current_term {
            self.adopt_term(args.term);
        }

        let may_vote = match &self.voted_for {
            None => true,
            Some(candidate) => *candidate == args.candidate_id,
        };

        let up_to_date = args.last_log_term > self.log.last_term()
            || (args.last_log_term == self.log.last_term()
                && args.last_log_index >= self.log.last_index());

        let vote_granted = may_vote && up_to_date;

        if vote_granted {
            self.voted_for = Some(args.candidate_id.clone());
            self.reset_election_timer();

            trace!(
                "Room {}: voted for {} in term {}",
                self.code,
                args.candidate_id,
                self.current_term
            );
        }

        RequestVoteReply {
            term: self.current_term,
            vote_granted,
        }
    }

    // Append receiver, including the consistency check and commit advance

    fn on_append_entries(&mut self, args: AppendEntriesArgs) -> AppendEntriesReply {
        if args.term < self.current_term {
            return AppendEntriesReply {
                term: self.current_term,
                success: false,
                match_index: 0,
            };
        }

        if args.term > self.current_term {
            self.adopt_term(args.term);
        } else if self.role != Role::Follower {
            self.step_down();
        }

        self.set_leader(Some(args.leader_id.clone()));
        self.reset_election_timer();

        let consistent = args.prev_log_index == 0
            || self.log.term_at(args.prev_log_index) == Some(args.prev_log_term);

        if !consistent {
            // The hint lets the leader skip straight back to our log's end
            return AppendEntriesReply {
                term: self.current_term,
                success: false,
                match_index: self.log.last_index(),
            };
        }

        let appended = args.entries.len() as u64;

        // Keep whatever already matches and cut the log at the first
        // conflict; committed entries are never rewritten by a stale
        // round that got delivered late
        let mut index = args.prev_log_index;

        for entry in args.entries {
            index += 1;

            match self.log.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.log.truncate_after(index - 1);
                    self.log.append(entry);
                }
                None => self.log.append(entry),
            }
        }

        let match_index = args.prev_log_index + appended;

        if args.leader_commit > self.commit_index {
            self.commit_index = args.leader_commit.min(self.log.last_index());
            self.apply_committed();
        }

        AppendEntriesReply {
            term: self.current_term,
            success: true,
            match_index,
        }
    }

    fn on_propose(&mut self, operation: Operation) -> Result<(), ProposeError> {
        if self.poisoned.is_some() {
            return Err(ProposeError::Poisoned);
        }

        if self.role != Role::Leader {
            return Err(ProposeError::NotLeader {
                leader: self.leader_id.clone(),
            });
        }

        let entry = LogEntry {
            term: self.current_term,
            index: self.log.last_index() + 1,
            operation,
        };

        trace!(
            "Room {}: proposing entry {} in term {}",
            self.code,
            entry.index,
            entry.term
        );

        self.log.append(entry);

        // A single-node room commits right away; anyone else needs a round
        self.advance_commit();
        self.broadcast_append();

        Ok(())
    }

    fn on_vote_reply(
        &mut self,
        peer: NodeId,
        term_at_send: u64,
        result: Result<RequestVoteReply, TransportError>,
    ) {
        let reply = match result {
            Ok(reply) => reply,
            Err(error) => {
                debug!("Room {}: vote request to {} failed: {}", self.code, peer, error);
                return;
            }
        };

        if reply.term > self.current_term {
            self.adopt_term(reply.term);
            return;
        }

        let current = self.role == Role::Candidate && term_at_send == self.current_term;

        if current && reply.vote_granted {
            self.votes.insert(peer);

            if self.has_majority(self.votes.len()) {
                self.become_leader();
            }
        }
    }

    fn on_append_reply(
        &mut self,
        peer: NodeId,
        term_at_send: u64,
        result: Result<AppendEntriesReply, TransportError>,
    ) {
        self.in_flight.remove(&peer);

        let reply = match result {
            Ok(reply) => reply,
            Err(error) => {
                // The next heartbeat retries; nothing else to do
                trace!("Room {}: replication to {} failed: {}", self.code, peer, error);
                self.pending.remove(&peer);
                return;
            }
        };

        if reply.term > self.current_term {
            self.adopt_term(reply.term);
            return;
        }

        if self.role != Role::Leader || term_at_send != self.current_term {
            return;
        }

        if reply.success {
            let matched = self
                .match_index
                .get(&peer)
                .copied()
                .unwrap_or(0)
                .max(reply.match_index);

            self.match_index.insert(peer.clone(), matched);
            self.next_index.insert(peer.clone(), matched + 1);
            self.advance_commit();

            let behind = matched < self.log.last_index();

            if self.pending.remove(&peer) || behind {
                self.replicate_to(&peer);
            }
        } else {
            // Fast backtrack toward the follower's log end, then retry
            let next = self.next_index.get(&peer).copied().unwrap_or(1);
            let backed_off = next.saturating_sub(1).min(reply.match_index + 1).max(1);

            self.next_index.insert(peer.clone(), backed_off);
            self.pending.remove(&peer);
            self.replicate_to(&peer);
        }
    }

    // Elections

    fn start_election(&mut self) {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.node_id.clone());
        self.votes = HashSet::from([self.node_id.clone()]);
        self.set_leader(None);
        self.reset_election_timer();

        debug!(
            "Room {}: {} starts an election for term {}",
            self.code, self.node_id, self.current_term
        );

        if self.has_majority(self.votes.len()) {
            self.become_leader();
            return;
        }

        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.node_id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        for peer in self.peers.clone() {
            let transport = Arc::clone(&self.transport);
            let self_tx = self.self_tx.clone();
            let code = self.code.clone();
            let args = args.clone();
            let term_at_send = self.current_term;

            tokio::spawn(async move {
                let result = transport.request_vote(&peer, &code, args).await;

                let _ = self_tx
                    .send(GroupEvent::VoteReply {
                        peer,
                        term_at_send,
                        result,
                    })
                    .await;
            });
        }
    }

    fn become_leader(&mut self) {
        info!(
            "Room {}: {} is the leader of term {}",
            self.code, self.node_id, self.current_term
        );

        self.role = Role::Leader;
        self.set_leader(Some(self.node_id.clone()));
        self.in_flight.clear();
        self.pending.clear();

        for peer in &self.peers {
            self.next_index
                .insert(peer.clone(), self.log.last_index() + 1);
            self.match_index.insert(peer.clone(), 0);
        }

        self.broadcast_append();
        self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval();
    }

    // Replication

    fn broadcast_append(&mut self) {
        for peer in self.peers.clone() {
            self.replicate_to(&peer);
        }
    }

    /// Sends one replication round to a peer, unless one is already in
    /// flight, in which case the request coalesces into the next round.
    fn replicate_to(&mut self, peer: &NodeId) {
        if self.in_flight.contains(peer) {
            self.pending.insert(peer.clone());
            return;
        }

        let next = self.next_index.get(peer).copied().unwrap_or(1);
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self.log.slice_from(next, self.config.max_append_batch);

        let args = AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.node_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };

        // Heartbeats are too frequent to be worth a line each
        if !args.is_heartbeat() {
            trace!(
                "Room {}: sending entries {}..={} to {}",
                self.code,
                next,
                prev_log_index + args.entries.len() as u64,
                peer
            );
        }

        self.in_flight.insert(peer.clone());

        let transport = Arc::clone(&self.transport);
        let self_tx = self.self_tx.clone();
        let code = self.code.clone();
        let peer = peer.clone();
        let term_at_send = self.current_term;

        tokio::spawn(async move {
            let result = transport.append_entries(&peer, &code, args).await;

            let _ = self_tx
                .send(GroupEvent::AppendReply {
                    peer,
                    term_at_send,
                    result,
                })
                .await;
        });
    }

    /// Advances the commit index to the highest entry of the current term
    /// replicated on a majority. Entries of older terms never commit by
    /// count alone.
    fn advance_commit(&mut self) {
        let mut candidate = self.log.last_index();

        while candidate > self.commit_index {
            match self.log.term_at(candidate) {
                Some(term) if term == self.current_term => {
                    let replicas = 1 + self
                        .peers
                        .iter()
                        .filter(|peer| {
                            self.match_index.get(*peer).copied().unwrap_or(0) >= candidate
                        })
                        .count();

                    if self.has_majority(replicas) {
                        self.commit_index = candidate;
                        self.apply_committed();
                        return;
                    }
                }
                // Everything below is from an older term
                Some(_) => return,
                None => return,
            }

            candidate -= 1;
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            if self.poisoned.is_some() {
                return;
            }

            let next = self.last_applied + 1;

            let operation = match self.log.entry(next) {
                Some(entry) => entry.operation.clone(),
                None => {
                    self.poison(format!("committed entry {} is missing", next));
                    return;
                }
            };

            self.state.apply(&operation);
            self.last_applied = next;

            if let Err(reason) = self.state.check_invariants() {
                self.poison(reason);
                return;
            }

            let event = ConsensusEvent::StateCommitted {
                code: self.code.clone(),
                state: self.state.clone(),
            };

            event.log();
            let _ = self.events.send(event);
        }
    }

    // Term and role bookkeeping

    fn adopt_term(&mut self, term: u64) {
        self.current_term = term;
        self.voted_for = None;
        self.step_down();
    }

    fn step_down(&mut self) {
        if self.role == Role::Leader {
            info!(
                "Room {}: {} steps down in term {}",
                self.code, self.node_id, self.current_term
            );
        }

        self.role = Role::Follower;
        self.set_leader(None);
        self.votes.clear();
        self.reset_election_timer();
    }

    fn set_leader(&mut self, leader: Option<NodeId>) {
        if self.leader_id == leader {
            return;
        }

        self.leader_id = leader.clone();

        let event = ConsensusEvent::LeaderChanged {
            code: self.code.clone(),
            leader_id: leader,
        };

        event.log();
        let _ = self.events.send(event);
    }

    fn poison(&mut self, reason: String) {
        warn!("Room {} poisoned: {}", self.code, reason);
        self.poisoned = Some(reason.clone());

        let event = ConsensusEvent::GroupPoisoned {
            code: self.code.clone(),
            reason,
        };

        event.log();
        let _ = self.events.send(event);
    }

    fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    fn has_majority(&self, count: usize) -> bool {
        count * 2 > self.peers.len() + 1
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use dashmap::DashMap;
    use tokio::time::sleep;

    use super::*;
    use crate::{EventReceiver, OperationKind};

    #[derive(Default)]
    struct TestNet {
        nodes: DashMap<NodeId, RaftGroup>,
        cut: Mutex<HashSet<(NodeId, NodeId)>>,
    }

    impl TestNet {
        fn is_cut(&self, a: &NodeId, b: &NodeId) -> bool {
            let cut = self.cut.lock().expect("cut lock");

            cut.contains(&(a.clone(), b.clone())) || cut.contains(&(b.clone(), a.clone()))
        }

        fn partition(&self, minority: &[&str], majority: &[&str]) {
            let mut cut = self.cut.lock().expect("cut lock");

            for a in minority {
                for b in majority {
                    cut.insert((a.to_string(), b.to_string()));
                }
            }
        }

        fn heal(&self) {
            self.cut.lock().expect("cut lock").clear();
        }

        fn group(&self, id: &str) -> RaftGroup {
            self.nodes.get(id).expect("node exists").clone()
        }
    }

    struct TestTransport {
        net: Arc<TestNet>,
        from: NodeId,
    }

    impl TestTransport {
        fn target(&self, peer: &NodeId) -> Result<RaftGroup, TransportError> {
            if self.net.is_cut(&self.from, peer) {
                return Err(TransportError::Unreachable("partitioned".to_string()));
            }

            self.net
                .nodes
                .get(peer)
                .map(|group| group.clone())
                .ok_or_else(|| TransportError::Unreachable("no such node".to_string()))
        }
    }

    #[async_trait]
    impl RaftTransport for TestTransport {
        async fn request_vote(
            &self,
            peer: &NodeId,
            _room: &RoomCode,
            args: RequestVoteArgs,
        ) -> Result<RequestVoteReply, TransportError> {
            let target = self.target(peer)?;

            match target.deliver(RaftMessage::RequestVote(args)).await {
                Ok(RaftReply::RequestVote(reply)) => Ok(reply),
                _ => Err(TransportError::Unreachable("node stopped".to_string())),
            }
        }

        async fn append_entries(
            &self,
            peer: &NodeId,
            _room: &RoomCode,
            args: AppendEntriesArgs,
        ) -> Result<AppendEntriesReply, TransportError> {
            let target = self.target(peer)?;

            match target.deliver(RaftMessage::AppendEntries(args)).await {
                Ok(RaftReply::AppendEntries(reply)) => Ok(reply),
                _ => Err(TransportError::Unreachable("node stopped".to_string())),
            }
        }
    }

    fn spawn_cluster(
        ids: &[&str],
        bootstrap: Option<&str>,
    ) -> (Arc<TestNet>, EventReceiver, RoomCode) {
        let code = RoomCode::parse("ABC123").expect("valid code");
        let (events, receiver) = crossbeam::channel::unbounded();
        let net = Arc::new(TestNet::default());

        for id in ids {
            let peers = ids
                .iter()
                .filter(|peer| *peer != id)
                .map(|peer| peer.to_string())
                .collect();

            let transport = Arc::new(TestTransport {
                net: net.clone(),
                from: id.to_string(),
            });

            let group = RaftGroup::new(
                code.clone(),
                id.to_string(),
                peers,
                Config::default(),
                transport,
                events.clone(),
                bootstrap == Some(*id),
            );

            net.nodes.insert(id.to_string(), group);
        }

        (net, receiver, code)
    }

    fn chat(text: &str, user: &str, timestamp: u64) -> Operation {
        Operation::new(
            OperationKind::ChatMessage {
                text: text.to_string(),
            },
            user,
            timestamp,
        )
    }

    async fn leader_among(net: &TestNet, ids: &[&str]) -> Option<NodeId> {
        for id in ids {
            let status = net.group(id).status().await.ok()?;

            if status.role == Role::Leader {
                return Some(id.to_string());
            }
        }

        None
    }

    async fn wait_for_leader(net: &TestNet, ids: &[&str]) -> NodeId {
        for _ in 0..200 {
            if let Some(leader) = leader_among(net, ids).await {
                return leader;
            }

            sleep(Duration::from_millis(25)).await;
        }

        panic!("no leader elected within the deadline");
    }

    async fn wait_for_convergence(net: &TestNet, ids: &[&str], applied: u64) -> Vec<RoomState> {
        for _ in 0..400 {
            let mut done = true;

            for id in ids {
                let status = net.group(id).status().await.expect("status");

                if status.last_applied != applied {
                    done = false;
                    break;
                }
            }

            if done {
                let mut states = Vec::new();

                for id in ids {
                    states.push(net.group(id).snapshot().await.expect("snapshot"));
                }

                return states;
            }

            sleep(Duration::from_millis(25)).await;
        }

        panic!("nodes did not converge to {} applied entries", applied);
    }

    fn assert_identical(states: &[RoomState]) {
        let reference = serde_json::to_string(&states[0]).expect("serializes");

        for state in &states[1..] {
            let bytes = serde_json::to_string(state).expect("serializes");
            assert_eq!(bytes, reference, "replicas diverged");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bootstrap_leader_replicates_to_all_nodes() {
        let ids = ["n1", "n2", "n3"];
        let (net, events, _code) = spawn_cluster(&ids, Some("n1"));
        let leader = net.group("n1");

        leader
            .propose(Operation::new(
                OperationKind::RoomCreate {
                    username: "Alice".to_string(),
                },
                "u1",
                1000,
            ))
            .await
            .expect("bootstrap leader accepts proposes");

        leader
            .propose(Operation::new(
                OperationKind::RoomJoin {
                    username: "Bob".to_string(),
                },
                "u2",
                2000,
            ))
            .await
            .expect("proposes");

        leader
            .propose(chat("hello everyone", "u2", 3000))
            .await
            .expect("proposes");

        let states = wait_for_convergence(&net, &ids, 3).await;
        assert_identical(&states);

        let state = &states[0];
        assert_eq!(state.participants.len(), 2);
        assert!(state.participants[0].is_creator);
        assert!(!state.participants[1].is_creator);
        assert_eq!(state.chat_log[0].text, "hello everyone");

        // Commits surfaced through the event bus as they applied
        let committed = events
            .try_iter()
            .filter(|event| matches!(event, ConsensusEvent::StateCommitted { .. }))
            .count();

        assert!(committed >= 3, "expected fanout per apply, saw {}", committed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn followers_elect_exactly_one_leader() {
        let ids = ["n1", "n2", "n3"];
        let (net, _events, _code) = spawn_cluster(&ids, None);

        let elected = wait_for_leader(&net, &ids).await;

        // Settle, then confirm no term ever has more than one leader
        sleep(Duration::from_millis(300)).await;

        let mut leaders = Vec::new();

        for id in &ids {
            let status = net.group(id).status().await.expect("status");

            if status.role == Role::Leader {
                leaders.push((id.to_string(), status.current_term));
            }
        }

        assert!(!leaders.is_empty(), "the cluster lost its leader");

        let mut terms: Vec<u64> = leaders.iter().map(|(_, term)| *term).collect();
        terms.sort_unstable();
        terms.dedup();

        assert_eq!(
            terms.len(),
            leaders.len(),
            "two leaders share a term: {:?}",
            leaders
        );

        // A follower refuses writes and names the leader it knows
        let follower = ids
            .iter()
            .find(|id| !leaders.iter().any(|(leader, _)| leader == **id))
            .expect("a follower exists");

        let result = net.group(follower).propose(chat("nope", "u1", 1)).await;

        match result {
            Err(ProposeError::NotLeader { leader: Some(_) }) => {}
            other => panic!("expected a not-leader rejection, got {:?}", other),
        }

        assert!(ids.contains(&elected.as_str()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn survivors_elect_a_new_leader_and_keep_committing() {
        let ids = ["n1", "n2", "n3"];
        let (net, _events, _code) = spawn_cluster(&ids, Some("n1"));
        let old_leader = net.group("n1");

        old_leader
            .propose(Operation::new(
                OperationKind::RoomCreate {
                    username: "Alice".to_string(),
                },
                "u1",
                1000,
            ))
            .await
            .expect("proposes");

        wait_for_convergence(&net, &ids, 1).await;

        // Kill the leader
        old_leader.shutdown();

        let survivors = ["n2", "n3"];
        let new_leader = wait_for_leader(&net, &survivors).await;

        net.group(&new_leader)
            .propose(chat("still here", "u2", 2000))
            .await
            .expect("new leader accepts proposes");

        let states = wait_for_convergence(&net, &survivors, 2).await;
        assert_identical(&states);
        assert_eq!(states[0].chat_log[0].text, "still here");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn minority_writes_are_discarded_after_heal() {
        let ids = ["n1", "n2", "n3", "n4", "n5"];
        let (net, _events, _code) = spawn_cluster(&ids, Some("n1"));
        let old_leader = net.group("n1");

        old_leader
            .propose(Operation::new(
                OperationKind::RoomCreate {
                    username: "Alice".to_string(),
                },
                "u1",
                1000,
            ))
            .await
            .expect("proposes");

        wait_for_convergence(&net, &ids, 1).await;

        // Strand the old leader with one follower
        net.partition(&["n1", "n2"], &["n3", "n4", "n5"]);

        // The minority side appends but can never commit this
        old_leader
            .propose(chat("stranded", "u1", 2000))
            .await
            .expect("still believes it leads");

        let majority = ["n3", "n4", "n5"];
        let new_leader = wait_for_leader(&net, &majority).await;

        net.group(&new_leader)
            .propose(chat("committed", "u2", 3000))
            .await
            .expect("majority leader accepts proposes");

        wait_for_convergence(&net, &majority, 2).await;

        let stranded_status = old_leader.status().await.expect("status");
        assert_eq!(
            stranded_status.commit_index, 1,
            "a minority write must not commit"
        );

        net.heal();

        let states = wait_for_convergence(&net, &ids, 2).await;
        assert_identical(&states);

        let texts: Vec<_> = states[0].chat_log.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["committed"], "the divergent tail must vanish");

        let healed = old_leader.status().await.expect("status");
        assert_eq!(healed.role, Role::Follower);
        assert_eq!(healed.last_log_index, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_node_rooms_commit_immediately() {
        let ids = ["n1"];
        let (net, _events, _code) = spawn_cluster(&ids, Some("n1"));
        let group = net.group("n1");

        group
            .propose(Operation::new(
                OperationKind::RoomCreate {
                    username: "Solo".to_string(),
                },
                "u1",
                1,
            ))
            .await
            .expect("proposes");

        let status = group.status().await.expect("status");
        assert_eq!(status.commit_index, 1);
        assert_eq!(status.last_applied, 1);

        let state = group.snapshot().await.expect("snapshot");
        assert_eq!(state.participants.len(), 1);
    }
}
