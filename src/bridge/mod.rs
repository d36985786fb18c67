mod capability;
mod channel;
pub mod message;

use thiserror::Error;

pub use capability::Capability;
pub use channel::{message_channel, ContextPort, HostBridge, HostPort, PROTOCOL_VERSION, TARGET_ORIGIN};
pub use message::{actions, BridgeMessage, HandshakeAck, HostAction, LoadedSummary, PersistedEntry};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("host bridge channel closed")]
    Closed,
    #[error("host did not answer {action} within {waited_ms}ms")]
    Timeout { action: String, waited_ms: u64 },
    #[error("handshake failed after {attempts} attempt(s): {last}")]
    HandshakeFailed { attempts: u32, last: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}
