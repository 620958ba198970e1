use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// The authoritative host-to-configs mapping, replicated through the raft
/// log.
///
/// Every `(host, config)` entry owns a one-shot cancellation token created on
/// insertion and triggered on removal or replacement. The tokens are local to
/// each replica and never serialized; they are what stops the task runners
/// when an assignment is revoked.
///
/// Tokens are cancelled while the write lock is held, so a concurrent `put`
/// for the same key can never observe a stale, still-active token.
#[derive(Debug, Default)]
pub struct AssignmentStore {
    store: RwLock<HashMap<String, HashMap<String, CancellationToken>>>,
}

impl AssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns `config` to `host`, returning the fresh cancellation token.
    ///
    /// Replacing an existing assignment cancels the previous token before the
    /// new one is published.
    pub fn put(&self, host: &str, config: &str) -> CancellationToken {
        let mut store = self.store.write();
        let configs = store.entry(host.to_string()).or_default();
        if let Some(old) = configs.remove(config) {
            old.cancel();
        }
        let token = CancellationToken::new();
        configs.insert(config.to_string(), token.clone());
        token
    }

    /// Removes the assignment, cancelling its token.
    pub fn remove(&self, host: &str, config: &str) {
        let mut store = self.store.write();
        if let Some(configs) = store.get_mut(host) {
            if let Some(token) = configs.remove(config) {
                token.cancel();
            }
        }
    }

    /// Creates an empty slot for `host` so it shows up in the distribution
    /// statistics even before anything is assigned to it.
    pub fn touch(&self, host: &str) {
        self.store.write().entry(host.to_string()).or_default();
    }

    /// Drops empty host slots that are not in `keep`.
    pub fn retain_hosts(&self, keep: &[String]) {
        self.store
            .write()
            .retain(|host, configs| !configs.is_empty() || keep.iter().any(|k| k == host));
    }

    /// Whether `(host, config)` is currently assigned.
    pub fn contains(&self, host: &str, config: &str) -> bool {
        self.store
            .read()
            .get(host)
            .map(|configs| configs.contains_key(config))
            .unwrap_or(false)
    }

    /// Configs assigned to `host`, sorted.
    pub fn list(&self, host: &str) -> Vec<String> {
        let store = self.store.read();
        let mut configs: Vec<String> = store
            .get(host)
            .map(|configs| configs.keys().cloned().collect())
            .unwrap_or_default();
        configs.sort();
        configs
    }

    /// The whole mapping with sorted hosts and configs.
    pub fn dump(&self) -> BTreeMap<String, Vec<String>> {
        let store = self.store.read();
        store
            .iter()
            .map(|(host, configs)| {
                let mut names: Vec<String> = configs.keys().cloned().collect();
                names.sort();
                (host.clone(), names)
            })
            .collect()
    }

    /// Number of configs per host, sorted by host.
    pub fn distribution_statistic(&self) -> Vec<(String, usize)> {
        let store = self.store.read();
        let mut stats: Vec<(String, usize)> = store
            .iter()
            .map(|(host, configs)| (host.clone(), configs.len()))
            .collect();
        stats.sort();
        stats
    }

    /// Cancels every token and empties the store. Used by snapshot restore.
    pub fn clear(&self) {
        let mut store = self.store.write();
        for configs in store.values() {
            for token in configs.values() {
                token.cancel();
            }
        }
        store.clear();
    }
}
