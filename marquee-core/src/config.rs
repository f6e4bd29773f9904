use std::time::Duration;

use rand::{thread_rng, Rng};

/// The configuration of a node's consensus and session machinery.
#[derive(Debug, Clone)]
pub struct Config {
    /// The lower bound of the randomized election timeout, in milliseconds
    pub election_timeout_min_ms: u64,
    /// The upper bound of the randomized election timeout, in milliseconds
    pub election_timeout_max_ms: u64,
    /// How often a leader sends AppendEntries rounds, in milliseconds
    pub heartbeat_interval_ms: u64,
    /// How long an outbound peer call may take before it is treated as failed
    pub rpc_timeout_ms: u64,
    /// The largest frame accepted on either link, in bytes
    pub max_frame_bytes: usize,
    /// How many log entries a single replication round may carry
    pub max_append_batch: usize,
    /// How many messages a session's outbox may hold before older
    /// state updates are dropped in favor of newer ones
    pub session_outbox_cap: usize,
    /// How long an empty room without local subscribers is kept around
    pub room_idle_grace_ms: u64,
}

impl Config {
    /// Draws a fresh randomized election timeout.
    ///
    /// A new value is drawn on every reset so that two nodes which time
    /// out together are unlikely to split the vote again.
    pub fn random_election_timeout(&self) -> Duration {
        let millis =
            thread_rng().gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);

        Duration::from_millis(millis)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn room_idle_grace(&self) -> Duration {
        Duration::from_millis(self.room_idle_grace_ms)
    }

    /// The frame cap of the inter-node link.
    ///
    /// A replication round may carry a full batch of client sized
    /// operations, so the envelope cap scales with the batch cap.
    pub fn max_envelope_bytes(&self) -> usize {
        self.max_frame_bytes * (self.max_append_batch + 1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Wide enough apart that split votes are rare
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 500,
            // A few heartbeats always fit inside the election window
            heartbeat_interval_ms: 100,
            rpc_timeout_ms: 2000,
            max_frame_bytes: 64 * 1024,
            // Keeps a full replication round well under the frame cap
            max_append_batch: 32,
            session_outbox_cap: 256,
            room_idle_grace_ms: 60_000,
        }
    }
}
