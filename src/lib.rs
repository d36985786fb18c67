// Library exports for the binary and integration tests

pub mod bridge;
pub mod config;
pub mod host;
pub mod js;
pub mod storage;

pub use bridge::{message_channel, BridgeError, Capability, HostBridge};
pub use config::SandboxConfig;
pub use host::{HostEndpoint, HostSignals};
pub use js::{RenderPhase, SandboxSession, ScriptFetcher, SessionReport};
pub use storage::{HostStore, StorageShim};
