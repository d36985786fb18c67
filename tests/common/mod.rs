#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use sandbox_bridge::bridge::{actions, BridgeMessage, HostAction, HostPort, PersistedEntry};
use sandbox_bridge::js::{FetchError, FetchScript};
use sandbox_bridge::SandboxConfig;
use serde_json::json;
use tokio::task::JoinHandle;

/// Serves script bodies after a per-script delay; unknown sources 404.
#[derive(Default)]
pub struct LatencyFetcher {
    scripts: HashMap<String, (u64, String)>,
}

impl LatencyFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, src: &str, delay_ms: u64, body: &str) -> Self {
        self.scripts
            .insert(src.to_string(), (delay_ms, body.to_string()));
        self
    }
}

impl FetchScript for LatencyFetcher {
    fn fetch(&self, src: &str) -> LocalBoxFuture<'static, Result<String, FetchError>> {
        let entry = self.scripts.get(src).cloned();
        let src = src.to_string();
        Box::pin(async move {
            match entry {
                Some((delay_ms, body)) => {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    Ok(body)
                }
                None => Err(FetchError::Status {
                    url: src,
                    status: 404,
                }),
            }
        })
    }
}

pub fn fast_config() -> SandboxConfig {
    SandboxConfig {
        handshake_timeout_ms: 20,
        handshake_attempts: 2,
        ..SandboxConfig::default()
    }
}

/// A host that acknowledges the handshake with `seed` and records every
/// action it receives, in order, until the content side closes.
pub fn spawn_recording_host(
    mut port: HostPort,
    seed: Vec<PersistedEntry>,
) -> JoinHandle<Vec<HostAction>> {
    tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(raw) = port.recv().await {
            let action = HostAction::decode(&raw).expect("well-formed host message");
            if let HostAction::Handshake { id, .. } = &action {
                let ack = BridgeMessage::new(
                    actions::HANDSHAKE_ACK,
                    json!({ "id": id, "protocol": 1, "storage": seed }),
                );
                port.post(ack.encode().expect("encode ack"))
                    .expect("content still listening");
            }
            received.push(action);
        }
        received
    })
}

pub fn command_names(actions: &[HostAction]) -> Vec<String> {
    actions
        .iter()
        .filter_map(|action| match action {
            HostAction::Command { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}
