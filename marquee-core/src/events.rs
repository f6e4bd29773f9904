use crossbeam::channel::{Receiver, Sender};
use log::{error, info, trace};

use crate::{NodeId, RoomCode, RoomState};

pub type EventSender = Sender<ConsensusEvent>;
pub type EventReceiver = Receiver<ConsensusEvent>;

/// Describes the events a room's consensus group can emit.
#[derive(Debug)]
pub enum ConsensusEvent {
    /// A committed operation was folded into the room state.
    StateCommitted {
        code: RoomCode,
        /// The post-apply snapshot, safe to hand to subscribers.
        state: RoomState,
    },
    /// The group learned of a new leader, or lost track of the old one.
    LeaderChanged {
        code: RoomCode,
        leader_id: Option<NodeId>,
    },
    /// The group hit an apply fault and refuses further writes.
    GroupPoisoned { code: RoomCode, reason: String },
}

impl ConsensusEvent {
    pub fn log(&self) {
        match self {
            ConsensusEvent::StateCommitted { code, state } => {
                trace!(
                    "Room {} applied up to {} participants, {} chat messages",
                    code,
                    state.participants.len(),
                    state.chat_log.len()
                )
            }
            ConsensusEvent::LeaderChanged { code, leader_id } => match leader_id {
                Some(leader) => info!("Room {} now led by {}", code, leader),
                None => info!("Room {} has no known leader", code),
            },
            ConsensusEvent::GroupPoisoned { code, reason } => {
                error!("Room {} is unhealthy and refuses writes: {}", code, reason)
            }
        }
    }
}
