use std::time::Duration;

/// Knobs shared by the session and the reactor
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The port announced to the tracker
    pub port: u16,
    /// Upper bound on simultaneously open peer connections
    pub max_peers: usize,
    /// Applies to both the TCP connect and the handshake reply
    pub connect_timeout: Duration,
    /// How long a single reactor pass waits for socket activity
    pub poll_interval: Duration,
    /// A connection is dropped after sending this many corrupted pieces
    pub max_hash_failures: usize,
    /// Size of a single socket read
    pub read_buffer_size: usize,
}

impl ClientConfig {
    pub const DEFAULT_PORT: u16 = 6881;
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            port: Self::DEFAULT_PORT,
            max_peers: 30,
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            max_hash_failures: 3,
            read_buffer_size: 16 * 1024,
        }
    }
}
