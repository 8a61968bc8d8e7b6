//! Circuit and stream configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::flow_control::STREAM_WINDOW_START;

/// Tunables shared by every circuit a [`CircuitBuilder`](crate::CircuitBuilder) makes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Deadline for building the whole circuit
    pub build_timeout: Duration,

    /// Default timeout for a stream to get CONNECTED
    pub stream_timeout: Duration,

    /// Use CREATE_FAST towards the first hop
    pub use_create_fast: bool,

    /// Prefer ntor over TAP when a router has both keys
    pub prefer_ntor: bool,

    /// Inbound queue bound per stream, in cells
    pub stream_queue_len: usize,

    /// Bound of the per-circuit control-response channel
    pub control_queue_len: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            build_timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(15),
            use_create_fast: false,
            prefer_ntor: true,
            // window plus room for the END/CONNECTED cells around it
            stream_queue_len: usize::from(STREAM_WINDOW_START) + 16,
            control_queue_len: 8,
        }
    }
}

impl CircuitConfig {
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_create_fast(mut self, enabled: bool) -> Self {
        self.use_create_fast = enabled;
        self
    }

    pub fn with_prefer_ntor(mut self, prefer: bool) -> Self {
        self.prefer_ntor = prefer;
        self
    }

    pub fn with_stream_queue_len(mut self, len: usize) -> Self {
        self.stream_queue_len = len;
        self
    }
}
