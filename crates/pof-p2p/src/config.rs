use std::time::Duration;

/// Timing and size limits for one peer connection
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Deadline for a single write to the wire
    pub write_timeout: Duration,
    /// Pause between two keepalive packets
    pub keepalive_interval: Duration,
    /// Keepalives that may go unanswered before the peer is declared dead
    pub keepalive_limit: u64,
    /// Largest payload a header may announce
    pub max_payload_len: usize,
    /// Deadline for the whole handshake exchange
    pub handshake_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            write_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(3),
            keepalive_limit: 3,
            max_payload_len: 16 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl PeerConfig {
    /// Silence after which the keepalive task gives up on a peer
    pub fn dead_peer_window(&self) -> Duration {
        self.keepalive_interval * (self.keepalive_limit as u32 + 1)
    }
}
