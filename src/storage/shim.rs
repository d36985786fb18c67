use std::collections::HashMap;

use serde_json::json;
use tracing::trace;

use crate::bridge::{actions, Capability, HostBridge, PersistedEntry};

/// One key/value pair as content observes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub key: String,
    pub value: String,
    pub insertion_index: usize,
}

/// Synchronous key/value storage for content that has no storage of its own.
///
/// Reads are answered from the local cache only. Every mutation updates the
/// cache first and then posts exactly one message to the host; a failed
/// delivery never reaches the caller.
pub struct StorageShim {
    values: HashMap<String, String>,
    order: Vec<String>,
    bridge: HostBridge,
}

impl StorageShim {
    pub fn new(bridge: HostBridge) -> Self {
        Self {
            values: HashMap::new(),
            order: Vec::new(),
            bridge,
        }
    }

    /// Start from entries the host already persisted. Seeding posts nothing.
    pub fn seeded(bridge: HostBridge, entries: Vec<PersistedEntry>) -> Self {
        let mut shim = Self::new(bridge);
        for entry in entries {
            shim.put(entry.key, entry.value);
        }
        shim
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn key(&self, index: usize) -> Option<&str> {
        self.order.get(index).map(String::as_str)
    }

    pub fn get_item(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set_item(&mut self, key: &str, value: &str) {
        self.put(key.to_string(), value.to_string());
        trace!(target: "sandbox::storage", key, "setItem");
        self.bridge
            .send(actions::LS_SET_ITEM, json!({ "key": key, "value": value }));
    }

    pub fn remove_item(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.order.retain(|existing| existing != key);
        }
        trace!(target: "sandbox::storage", key, "removeItem");
        self.bridge
            .send(actions::LS_REMOVE_ITEM, json!({ "key": key }));
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.order.clear();
        trace!(target: "sandbox::storage", "clear");
        self.bridge.send(actions::LS_CLEAR, json!({}));
    }

    pub fn entries(&self) -> Vec<StorageEntry> {
        self.order
            .iter()
            .enumerate()
            .filter_map(|(insertion_index, key)| {
                self.values.get(key).map(|value| StorageEntry {
                    key: key.clone(),
                    value: value.clone(),
                    insertion_index,
                })
            })
            .collect()
    }

    fn put(&mut self, key: String, value: String) {
        if !self.values.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.values.insert(key, value);
    }
}

/// Storage as seen by content: with no host, reads come back empty and
/// writes are dropped.
impl Capability<StorageShim> {
    pub fn len(&self) -> usize {
        self.available().map(StorageShim::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key(&self, index: usize) -> Option<&str> {
        self.available().and_then(|shim| shim.key(index))
    }

    pub fn get_item(&self, key: &str) -> Option<&str> {
        self.available().and_then(|shim| shim.get_item(key))
    }

    pub fn set_item(&mut self, key: &str, value: &str) {
        match self.available_mut() {
            Some(shim) => shim.set_item(key, value),
            None => trace!(target: "sandbox::storage", key, "setItem dropped; storage unavailable"),
        }
    }

    pub fn remove_item(&mut self, key: &str) {
        if let Some(shim) = self.available_mut() {
            shim.remove_item(key);
        }
    }

    pub fn clear(&mut self) {
        if let Some(shim) = self.available_mut() {
            shim.clear();
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.available()
            .map(|shim| shim.order.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{message_channel, HostAction, HostPort};

    fn shim() -> (StorageShim, HostPort) {
        let (context, host) = message_channel();
        (StorageShim::new(HostBridge::new(context)), host)
    }

    fn drain(host: &mut HostPort) -> Vec<HostAction> {
        let mut actions = Vec::new();
        while let Ok(raw) = host.inbound.try_recv() {
            actions.push(HostAction::decode(&raw).unwrap());
        }
        actions
    }

    #[test]
    fn reads_see_writes_before_the_host_does() {
        let (mut shim, mut host) = shim();
        shim.set_item("k", "v");
        assert_eq!(shim.get_item("k"), Some("v"));
        assert_eq!(
            drain(&mut host),
            vec![HostAction::SetItem {
                key: "k".into(),
                value: "v".into()
            }]
        );
    }

    #[test]
    fn overwrite_keeps_index_and_removal_shifts() {
        let (mut shim, _host) = shim();
        shim.set_item("a", "1");
        shim.set_item("b", "2");
        shim.set_item("c", "3");
        shim.set_item("a", "4");
        assert_eq!(shim.key(0), Some("a"));
        assert_eq!(shim.get_item("a"), Some("4"));

        shim.remove_item("b");
        assert_eq!(shim.len(), 2);
        assert_eq!(shim.key(1), Some("c"));
        assert_eq!(shim.get_item("b"), None);
        assert_eq!(shim.key(2), None);
    }

    #[test]
    fn every_mutation_posts_exactly_one_message() {
        let (mut shim, mut host) = shim();
        shim.set_item("a", "1");
        shim.remove_item("missing");
        shim.clear();
        assert_eq!(
            drain(&mut host),
            vec![
                HostAction::SetItem {
                    key: "a".into(),
                    value: "1".into()
                },
                HostAction::RemoveItem {
                    key: "missing".into()
                },
                HostAction::Clear {},
            ]
        );
        assert_eq!(shim.len(), 0);
        assert_eq!(shim.key(0), None);
    }

    #[test]
    fn seeding_is_silent_and_ordered() {
        let (context, mut host) = message_channel();
        let shim = StorageShim::seeded(
            HostBridge::new(context),
            vec![
                PersistedEntry {
                    key: "x".into(),
                    value: "1".into(),
                },
                PersistedEntry {
                    key: "y".into(),
                    value: "2".into(),
                },
            ],
        );
        assert!(drain(&mut host).is_empty());
        let entries = shim.entries();
        assert_eq!(entries[1].key, "y");
        assert_eq!(entries[1].insertion_index, 1);
    }

    #[test]
    fn writes_to_a_departed_host_are_silent() {
        let (mut shim, host) = shim();
        drop(host);
        shim.set_item("k", "v");
        assert_eq!(shim.get_item("k"), Some("v"));
    }

    #[test]
    fn unavailable_storage_fails_closed() {
        let mut storage: Capability<StorageShim> = Capability::unavailable("handshake timed out");
        storage.set_item("k", "v");
        assert_eq!(storage.get_item("k"), None);
        assert_eq!(storage.len(), 0);
        assert_eq!(storage.key(0), None);
        storage.clear();
    }
}
