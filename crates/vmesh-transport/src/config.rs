use std::time::Duration;

/// Configuration for point-to-point links.
///
/// ```rust
/// use std::time::Duration;
/// use vmesh_transport::LinkConfig;
///
/// let config = LinkConfig::new()
///     .max_frame_size(16 * 1024)
///     .handshake_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Largest frame accepted from or sent to a neighbor.
    pub(crate) max_frame_size: usize,
    /// How long to wait for the remote hello.
    pub(crate) handshake_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkConfig {
    pub fn new() -> Self {
        Self {
            // 64 KiB payload plus a packet header.
            max_frame_size: 64 * 1024 + 64,
            handshake_timeout: Duration::from_secs(5),
        }
    }

    /// Set the maximum frame size (default: 64 KiB + 64).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Set the hello exchange timeout (default: 5 s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn get_max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn get_handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}
