use dashmap::DashMap;
use std::sync::Arc;

mod config;
mod consensus;
mod events;
mod protocol;
mod room;
mod util;

pub use config::*;
pub use consensus::*;
pub use events::*;
pub use protocol::*;
pub use room::*;
pub use util::*;

/// A node's unique identifier within the cluster.
pub type NodeId = String;

// Reduces verbosity
pub type Store<Id, T> = Arc<DashMap<Id, T>>;
pub type ArcedStore<Id, T> = Store<Id, Arc<T>>;
