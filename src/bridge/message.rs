use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::js::phase::RenderPhase;

/// Action names understood on either side of the bridge.
pub mod actions {
    pub const HANDSHAKE: &str = "handshake";
    pub const HANDSHAKE_ACK: &str = "handshake_ack";
    pub const LS_SET_ITEM: &str = "ls_setItem";
    pub const LS_REMOVE_ITEM: &str = "ls_removeItem";
    pub const LS_CLEAR: &str = "ls_clear";
    pub const RENDER_PHASE: &str = "render_phase";
    pub const CONTENT_LOADED: &str = "content_loaded";
    pub const COMMAND: &str = "command";
    pub const SCRIPT_ERROR: &str = "script_error";
}

/// Wire envelope exchanged between the restricted context and its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub action: String,
    #[serde(default)]
    pub params: JsonMap<String, JsonValue>,
}

impl BridgeMessage {
    /// Build an envelope. Non-object params are wrapped under `value`.
    pub fn new(action: impl Into<String>, params: JsonValue) -> Self {
        Self {
            action: action.into(),
            params: into_params(params),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Request/response correlation id, when the envelope carries one.
    pub fn correlation_id(&self) -> Option<&str> {
        self.params.get("id").and_then(JsonValue::as_str)
    }
}

pub(crate) fn into_params(params: JsonValue) -> JsonMap<String, JsonValue> {
    match params {
        JsonValue::Object(map) => map,
        JsonValue::Null => JsonMap::new(),
        other => {
            let mut map = JsonMap::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Storage entry as persisted by the host and replayed in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub key: String,
    pub value: String,
}

/// Host reply to the bootstrap handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub id: String,
    pub protocol: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub storage: Vec<PersistedEntry>,
}

/// Counts reported to the host once every script has run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedSummary {
    pub executed: usize,
    pub errored: usize,
    #[serde(default)]
    pub async_errors: usize,
}

/// Typed view of the messages a host receives from the restricted context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params")]
pub enum HostAction {
    #[serde(rename = "handshake")]
    Handshake {
        id: String,
        #[serde(default)]
        protocol: u32,
    },
    #[serde(rename = "ls_setItem")]
    SetItem { key: String, value: String },
    #[serde(rename = "ls_removeItem")]
    RemoveItem { key: String },
    #[serde(rename = "ls_clear")]
    Clear {},
    #[serde(rename = "render_phase")]
    PhaseChanged { phase: RenderPhase },
    #[serde(rename = "content_loaded")]
    ContentLoaded(LoadedSummary),
    #[serde(rename = "command")]
    Command {
        name: String,
        #[serde(default)]
        payload: JsonValue,
    },
    #[serde(rename = "script_error")]
    ScriptError {
        id: usize,
        src: String,
        message: String,
    },
}

impl HostAction {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wraps_scalar_params() {
        let message = BridgeMessage::new("command", json!(5));
        assert_eq!(message.params.get("value"), Some(&json!(5)));
        let empty = BridgeMessage::new(actions::LS_CLEAR, JsonValue::Null);
        assert!(empty.params.is_empty());
    }

    #[test]
    fn storage_envelopes_decode_as_host_actions() {
        let raw = BridgeMessage::new(actions::LS_SET_ITEM, json!({"key": "k", "value": "v"}))
            .encode()
            .unwrap();
        assert_eq!(
            HostAction::decode(&raw).unwrap(),
            HostAction::SetItem {
                key: "k".into(),
                value: "v".into()
            }
        );

        let clear = BridgeMessage::new(actions::LS_CLEAR, json!({})).encode().unwrap();
        assert_eq!(HostAction::decode(&clear).unwrap(), HostAction::Clear {});
    }

    #[test]
    fn phase_envelope_uses_lowercase_names() {
        let raw = r#"{"action":"render_phase","params":{"phase":"body"}}"#;
        assert_eq!(
            HostAction::decode(raw).unwrap(),
            HostAction::PhaseChanged {
                phase: RenderPhase::Body
            }
        );
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(HostAction::decode(r#"{"action":"ls_getItem","params":{"key":"k"}}"#).is_err());
    }

    #[test]
    fn correlation_id_reads_params() {
        let message = BridgeMessage::new(actions::HANDSHAKE_ACK, json!({"id": "abc"}));
        assert_eq!(message.correlation_id(), Some("abc"));
    }
}
