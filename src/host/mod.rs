//! The trusted side of the bridge.
//!
//! A [`HostEndpoint`] owns the [`HostPort`] of one content frame. It answers
//! the handshake with whatever the store already holds for the content id,
//! persists storage mutations, and republishes readiness signals for the
//! embedding page.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bridge::{
    actions, BridgeMessage, HandshakeAck, HostAction, HostPort, LoadedSummary, PROTOCOL_VERSION,
};
use crate::js::RenderPhase;
use crate::storage::HostStore;

/// A `sandbox.send(name, payload)` call as received by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostCommand {
    pub name: String,
    pub payload: JsonValue,
}

/// Host-side view of what the content has reported so far.
pub struct HostSignals {
    pub phase: watch::Receiver<RenderPhase>,
    pub loaded: watch::Receiver<Option<LoadedSummary>>,
    pub commands: UnboundedReceiver<HostCommand>,
}

pub struct HostEndpoint {
    content_id: String,
    store: Arc<HostStore>,
    port: HostPort,
    phase_tx: watch::Sender<RenderPhase>,
    loaded_tx: watch::Sender<Option<LoadedSummary>>,
    commands_tx: UnboundedSender<HostCommand>,
    answer_handshake: bool,
}

impl HostEndpoint {
    pub fn new(
        content_id: impl Into<String>,
        store: Arc<HostStore>,
        port: HostPort,
    ) -> (Self, HostSignals) {
        let (phase_tx, phase) = watch::channel(RenderPhase::Head);
        let (loaded_tx, loaded) = watch::channel(None);
        let (commands_tx, commands) = unbounded_channel();
        (
            Self {
                content_id: content_id.into(),
                store,
                port,
                phase_tx,
                loaded_tx,
                commands_tx,
                answer_handshake: true,
            },
            HostSignals {
                phase,
                loaded,
                commands,
            },
        )
    }

    /// Never answer the handshake, as a host that failed to load would.
    pub fn refuse_handshake(mut self) -> Self {
        self.answer_handshake = false;
        self
    }

    /// Process messages until the content side goes away. Messages already
    /// queued when it does are still applied.
    ///
    /// Returns the number of messages handled.
    pub async fn serve(mut self) -> usize {
        let mut handled = 0;
        while let Some(raw) = self.port.recv().await {
            match HostAction::decode(&raw) {
                Ok(action) => {
                    self.handle(action);
                    handled += 1;
                }
                Err(err) => {
                    warn!(target: "sandbox::host", error = %err, "ignoring malformed message");
                }
            }
        }
        debug!(target: "sandbox::host", content = %self.content_id, handled, "content channel closed");
        handled
    }

    fn handle(&mut self, action: HostAction) {
        let content_id = self.content_id.as_str();
        match action {
            HostAction::Handshake { id, protocol } => self.answer(id, protocol),
            HostAction::SetItem { key, value } => {
                if let Err(err) = self.store.set(content_id, &key, &value) {
                    warn!(target: "sandbox::host", key = %key, error = %err, "failed to persist item");
                }
            }
            HostAction::RemoveItem { key } => {
                if let Err(err) = self.store.remove(content_id, &key) {
                    warn!(target: "sandbox::host", key = %key, error = %err, "failed to remove item");
                }
            }
            HostAction::Clear {} => {
                if let Err(err) = self.store.clear(content_id) {
                    warn!(target: "sandbox::host", error = %err, "failed to clear storage");
                }
            }
            HostAction::PhaseChanged { phase } => {
                debug!(target: "sandbox::host", phase = phase.as_str(), "render phase");
                self.phase_tx.send_replace(phase);
            }
            HostAction::ContentLoaded(summary) => {
                info!(
                    target: "sandbox::host",
                    content = %content_id,
                    executed = summary.executed,
                    errored = summary.errored,
                    "content ready"
                );
                self.loaded_tx.send_replace(Some(summary));
            }
            HostAction::Command { name, payload } => {
                if self.commands_tx.send(HostCommand { name, payload }).is_err() {
                    debug!(target: "sandbox::host", "command dropped; nobody is listening");
                }
            }
            HostAction::ScriptError { id, src, message } => {
                warn!(target: "sandbox::host", id, src = %src, message = %message, "content script failed");
            }
        }
    }

    fn answer(&self, id: String, protocol: u32) {
        if !self.answer_handshake {
            debug!(target: "sandbox::host", "handshake ignored");
            return;
        }
        if protocol != PROTOCOL_VERSION {
            warn!(target: "sandbox::host", protocol, expected = PROTOCOL_VERSION, "protocol mismatch");
        }

        let storage = self.store.snapshot(&self.content_id).unwrap_or_else(|err| {
            warn!(target: "sandbox::host", error = %err, "failed to load persisted storage");
            Vec::new()
        });
        let ack = HandshakeAck {
            id,
            protocol: PROTOCOL_VERSION,
            capabilities: vec!["storage".to_string(), "command".to_string()],
            storage,
        };

        let reply = serde_json::to_value(&ack)
            .map(|params| BridgeMessage::new(actions::HANDSHAKE_ACK, params))
            .map_err(|err| err.to_string())
            .and_then(|message| message.encode().map_err(|err| err.to_string()));
        match reply {
            Ok(payload) => {
                if let Err(err) = self.port.post(payload) {
                    debug!(target: "sandbox::host", error = %err, "content left before handshake reply");
                }
            }
            Err(err) => warn!(target: "sandbox::host", error = %err, "failed to encode handshake reply"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{message_channel, HostBridge};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn handshake_replays_persisted_entries() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(HostStore::new_with_path(dir.path()).unwrap());
        store.set("lesson", "done", "yes").unwrap();

        let (context, host) = message_channel();
        let (endpoint, _signals) = HostEndpoint::new("lesson", Arc::clone(&store), host);
        let server = tokio::spawn(endpoint.serve());

        let bridge = HostBridge::new(context);
        let ack = bridge.handshake(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(ack.storage.len(), 1);
        assert_eq!(ack.storage[0].value, "yes");

        bridge.send(actions::LS_SET_ITEM, json!({ "key": "page", "value": "2" }));
        bridge.send(actions::RENDER_PHASE, json!({ "phase": "body" }));
        drop(bridge);
        assert_eq!(server.await.unwrap(), 3);
        assert_eq!(store.snapshot("lesson").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn refused_handshake_leaves_context_waiting() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(HostStore::new_with_path(dir.path()).unwrap());
        let (context, host) = message_channel();
        let (endpoint, _signals) = HostEndpoint::new("lesson", store, host);
        tokio::spawn(endpoint.refuse_handshake().serve());

        let bridge = HostBridge::new(context);
        let result = bridge.handshake(2, Duration::from_millis(20)).await;
        assert!(matches!(
            result,
            Err(crate::bridge::BridgeError::HandshakeFailed { attempts: 2, .. })
        ));
    }
}
