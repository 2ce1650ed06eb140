//! Network subsystem: one framed TCP link to one peer

pub mod connection;
pub mod probe;
pub mod queue;
pub mod socket;

use serde::Serialize;
use std::fmt;

pub use connection::ConnectionManager;
pub use probe::{Clock, LatencyProbe, LatencySample, SystemClock};
pub use queue::{create_shared_queue, EnqueueOutcome, SendQueue, SharedSendQueue};

use crate::error::TransportError;

/// Link lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Listening,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Listening => "listening",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Emitted on every state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub reason: String,
}

/// Notifications from the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    Status(ConnectionStatus),
    Latency(LatencySample),
    Error(TransportError),
}

/// Receiver of audio payloads from the peer
///
/// Called on the event loop for every Audio packet, in arrival order.
pub trait AudioSink: Send + 'static {
    fn deliver(&mut self, payload: &[u8]);
}

/// Discards everything; for links that only send
#[derive(Debug, Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn deliver(&mut self, _payload: &[u8]) {}
}
