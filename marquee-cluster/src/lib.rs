mod config;
mod gateway;
mod registry;
mod rpc;
mod transport;

use std::sync::Arc;
use std::thread;

use crossbeam::channel::unbounded;
use log::info;
use marquee_core::{ArcedStore, Config, ConsensusEvent, EventReceiver, EventSender, RoomCode};

pub use config::*;
pub use gateway::*;
pub use registry::*;
pub use rpc::*;
pub use transport::*;

/// One node of the cluster: the room registry, the client gateway, and
/// the peer transport, wired together around a shared context.
pub struct Cluster {
    pub context: ClusterContext,
    pub registry: Arc<RoomRegistry>,
    pub gateway: Arc<Gateway>,

    events: EventReceiver,
}

/// A type passed to the node's components, to access shared state and
/// reach the other components without holding them directly.
#[derive(Clone)]
pub struct ClusterContext {
    pub config: ClusterConfig,
    pub consensus: Config,
    pub transport: Arc<PeerClient>,
    pub events: EventSender,

    pub rooms: ArcedStore<RoomCode, RegisteredRoom>,
}

impl Cluster {
    pub fn new(config: ClusterConfig, consensus: Config) -> Self {
        let (event_sender, event_receiver) = unbounded();
        let transport = Arc::new(PeerClient::new(&config, &consensus));

        let context = ClusterContext {
            config,
            consensus,
            transport,
            events: event_sender,

            rooms: Default::default(),
        };

        let registry = Arc::new(RoomRegistry::new(&context));
        let gateway = Arc::new(Gateway::new(&context, registry.clone()));

        Self {
            context,
            registry,
            gateway,
            events: event_receiver,
        }
    }

    /// Starts the event pump, the idle room reaper, and a one-shot peer
    /// probe. Must be called on a runtime.
    pub fn run(&self) {
        let receiver = self.events.clone();
        let gateway = self.gateway.clone();

        // The fanout path is synchronous, so a plain thread drains the
        // bus without touching the runtime
        thread::spawn(move || {
            while let Ok(event) = receiver.recv() {
                match event {
                    ConsensusEvent::StateCommitted { code, state } => {
                        gateway.fanout(&code, &state)
                    }
                    ConsensusEvent::LeaderChanged { code, leader_id } => {
                        gateway.notify_leader_changed(&code, leader_id)
                    }
                    // Already logged by the group itself
                    ConsensusEvent::GroupPoisoned { .. } => {}
                }
            }
        });

        tokio::spawn(RoomRegistry::run_reaper(
            self.registry.clone(),
            self.gateway.clone(),
        ));

        let transport = self.context.transport.clone();
        tokio::spawn(async move { transport.log_peer_health().await });

        info!(
            "Node {} ready, {} peers configured",
            self.context.config.local_id,
            self.context.config.peer_ids().len()
        );
    }

    /// The raw consensus event stream, for embedders that pump by hand.
    pub fn events(&self) -> &EventReceiver {
        &self.events
    }

    pub fn node_id(&self) -> &str {
        &self.context.config.local_id
    }
}
