use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use marquee_core::{NodeId, RaftGroup, RaftTransport, RoomCode};
use parking_lot::Mutex;
use thiserror::Error;

use crate::{ClusterContext, Gateway};

/// How often idle rooms are swept.
const REAPER_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Room {0} does not exist")]
    RoomNotFound(RoomCode),
}

/// A room hosted on this node: its consensus group plus the local
/// bookkeeping needed to reap it once it empties out.
pub struct RegisteredRoom {
    pub raft: RaftGroup,
    /// The node whose allocation instantiated this room, so a repeated
    /// create handshake can be told apart from a code collision.
    allocated_by: NodeId,
    idle_since: Mutex<Option<Instant>>,
}

impl RegisteredRoom {
    pub fn allocated_by(&self) -> &NodeId {
        &self.allocated_by
    }
}

/// Maintains the rooms this node hosts.
///
/// Every node in the cluster holds an entry for every live room; writes
/// go through each room's consensus group, never through the registry.
pub struct RoomRegistry {
    context: ClusterContext,
}

impl RoomRegistry {
    pub fn new(context: &ClusterContext) -> Self {
        Self {
            context: context.clone(),
        }
    }

    pub fn contains(&self, code: &RoomCode) -> bool {
        self.context.rooms.contains_key(code)
    }

    /// Instantiates a room's consensus group, or returns the existing one.
    ///
    /// The allocating node passes `bootstrap_as_leader`; peers reached by
    /// the create handshake do not, and record the allocator instead. The
    /// boolean reports whether the room was created by this call.
    pub fn create_room(
        &self,
        code: &RoomCode,
        bootstrap_as_leader: bool,
        allocated_by: NodeId,
    ) -> (Arc<RegisteredRoom>, bool) {
        use dashmap::mapref::entry::Entry;

        match self.context.rooms.entry(code.clone()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(vacant) => {
                let transport: Arc<dyn RaftTransport> = self.context.transport.clone();

                let raft = RaftGroup::new(
                    code.clone(),
                    self.context.config.local_id.clone(),
                    self.context.config.peer_ids(),
                    self.context.consensus.clone(),
                    transport,
                    self.context.events.clone(),
                    bootstrap_as_leader,
                );

                let room = Arc::new(RegisteredRoom {
                    raft,
                    allocated_by,
                    idle_since: Mutex::new(None),
                });

                vacant.insert(room.clone());

                info!(
                    "Room {} registered{}",
                    code,
                    if bootstrap_as_leader { " (allocated here)" } else { "" }
                );

                (room, true)
            }
        }
    }

    pub fn room(&self, code: &RoomCode) -> Result<Arc<RegisteredRoom>, RegistryError> {
        self.context
            .rooms
            .get(code)
            .map(|room| room.clone())
            .ok_or_else(|| RegistryError::RoomNotFound(code.clone()))
    }

    /// Stops a room's consensus group and forgets it locally.
    pub fn drop_room(&self, code: &RoomCode) {
        if let Some((_, room)) = self.context.rooms.remove(code) {
            room.raft.shutdown();
            info!("Room {} dropped", code);
        }
    }

    /// Drops rooms that have stayed empty and unwatched for the whole
    /// idle grace period. Destruction is a local concern; other nodes
    /// reap on their own schedule.
    pub async fn sweep(&self, gateway: &Gateway) {
        let grace = self.context.consensus.room_idle_grace();

        let codes: Vec<RoomCode> = self
            .context
            .rooms
            .iter()
            .map(|room| room.key().clone())
            .collect();

        for code in codes {
            let Some(room) = self.context.rooms.get(&code).map(|room| room.clone()) else {
                continue;
            };

            let state = match room.raft.snapshot().await {
                Ok(state) => state,
                // The group stopped underneath us; forget the husk
                Err(_) => {
                    self.drop_room(&code);
                    continue;
                }
            };

            let idle = state.participants.is_empty() && gateway.subscriber_count(&code) == 0;

            if !idle {
                *room.idle_since.lock() = None;
                continue;
            }

            let expired = {
                let mut idle_since = room.idle_since.lock();

                match *idle_since {
                    None => {
                        *idle_since = Some(Instant::now());
                        false
                    }
                    Some(since) => since.elapsed() >= grace,
                }
            };

            if expired {
                info!("Room {} sat empty past its grace period", code);
                self.drop_room(&code);
            }
        }
    }

    pub async fn run_reaper(registry: Arc<Self>, gateway: Arc<Gateway>) {
        let mut interval = tokio::time::interval(REAPER_INTERVAL);

        loop {
            interval.tick().await;
            registry.sweep(&gateway).await;
        }
    }
}
