use std::rc::Rc;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::message::{actions, into_params, BridgeMessage, HandshakeAck};
use super::BridgeError;

/// Protocol revision announced in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages leave the restricted context addressed to any origin; origin
/// checks belong to the host.
pub const TARGET_ORIGIN: &str = "*";

/// The restricted context's end of the cross-context messaging primitive.
#[derive(Debug)]
pub struct ContextPort {
    outbound: UnboundedSender<String>,
    inbound: UnboundedReceiver<String>,
}

/// The host's end of the cross-context messaging primitive.
#[derive(Debug)]
pub struct HostPort {
    pub(crate) outbound: UnboundedSender<String>,
    pub(crate) inbound: UnboundedReceiver<String>,
}

impl HostPort {
    /// Post a raw payload into the restricted context.
    pub fn post(&self, payload: String) -> Result<(), BridgeError> {
        self.outbound.send(payload).map_err(|_| BridgeError::Closed)
    }

    /// Await the next raw payload from the restricted context.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }
}

/// Create a connected pair of ports. Payloads are plain strings, as they are
/// for a browser `postMessage` between frames.
pub fn message_channel() -> (ContextPort, HostPort) {
    let (to_host, from_context) = unbounded_channel();
    let (to_context, from_host) = unbounded_channel();
    (
        ContextPort {
            outbound: to_host,
            inbound: from_host,
        },
        HostPort {
            outbound: to_context,
            inbound: from_context,
        },
    )
}

/// Typed channel from the restricted context to its trusted host.
///
/// Sends are fire-and-forget: a host that has gone away simply never sees the
/// message. Only [`HostBridge::request`] waits for an answer, matched by a
/// generated correlation id.
#[derive(Clone)]
pub struct HostBridge {
    outbound: UnboundedSender<String>,
    inbound: Rc<Mutex<UnboundedReceiver<String>>>,
}

impl HostBridge {
    pub fn new(port: ContextPort) -> Self {
        Self {
            outbound: port.outbound,
            inbound: Rc::new(Mutex::new(port.inbound)),
        }
    }

    /// Serialize and dispatch an envelope, swallowing delivery failures.
    pub fn send(&self, action: &str, params: JsonValue) {
        let message = BridgeMessage::new(action, params);
        if let Err(err) = self.post(&message) {
            debug!(
                target: "sandbox::bridge",
                action,
                origin = TARGET_ORIGIN,
                error = %err,
                "bridge message dropped"
            );
        }
    }

    /// Serialize and dispatch an envelope, reporting delivery failures.
    pub fn post(&self, message: &BridgeMessage) -> Result<(), BridgeError> {
        let payload = message.encode()?;
        self.outbound.send(payload).map_err(|_| BridgeError::Closed)
    }

    /// Send a request and wait for the reply carrying the same `id`.
    pub async fn request(
        &self,
        action: &str,
        params: JsonValue,
        timeout: Duration,
    ) -> Result<BridgeMessage, BridgeError> {
        let id = Uuid::new_v4().to_string();
        let mut params = into_params(params);
        params.insert("id".to_string(), JsonValue::String(id.clone()));
        self.post(&BridgeMessage {
            action: action.to_string(),
            params,
        })?;

        let mut inbound = self.inbound.lock().await;
        let wait_for_reply = async {
            loop {
                let Some(raw) = inbound.recv().await else {
                    return Err(BridgeError::Closed);
                };
                match BridgeMessage::decode(&raw) {
                    Ok(message) if message.correlation_id() == Some(id.as_str()) => {
                        return Ok(message)
                    }
                    Ok(message) => {
                        debug!(
                            target: "sandbox::bridge",
                            action = %message.action,
                            "ignoring uncorrelated host message"
                        );
                    }
                    Err(err) => {
                        warn!(target: "sandbox::bridge", error = %err, "malformed host message");
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait_for_reply).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                action: action.to_string(),
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Confirm the host is present, retrying a bounded number of times.
    pub async fn handshake(
        &self,
        attempts: u32,
        timeout: Duration,
    ) -> Result<HandshakeAck, BridgeError> {
        let attempts = attempts.max(1);
        let mut last_error = BridgeError::Closed;

        for attempt in 1..=attempts {
            match self
                .request(
                    actions::HANDSHAKE,
                    json!({ "protocol": PROTOCOL_VERSION }),
                    timeout,
                )
                .await
            {
                Ok(reply) if reply.action == actions::HANDSHAKE_ACK => {
                    let ack: HandshakeAck =
                        serde_json::from_value(JsonValue::Object(reply.params))?;
                    debug!(
                        target: "sandbox::bridge",
                        attempt,
                        protocol = ack.protocol,
                        entries = ack.storage.len(),
                        "host handshake complete"
                    );
                    return Ok(ack);
                }
                Ok(reply) => {
                    return Err(BridgeError::Protocol(format!(
                        "expected {} but host answered {}",
                        actions::HANDSHAKE_ACK,
                        reply.action
                    )));
                }
                Err(BridgeError::Closed) => return Err(BridgeError::Closed),
                Err(err) => {
                    warn!(target: "sandbox::bridge", attempt, error = %err, "handshake attempt failed");
                    last_error = err;
                }
            }
        }

        Err(BridgeError::HandshakeFailed {
            attempts,
            last: last_error.to_string(),
        })
    }
}
