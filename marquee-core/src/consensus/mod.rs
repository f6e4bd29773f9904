mod group;
mod log;
mod messages;
mod transport;

pub use group::*;
pub use log::*;
pub use messages::*;
pub use transport::*;

/// The role a group currently plays within its room's consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}
