use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use combaine_node::{ClusterMember, NodeName};
use combaine_repository::Repository;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consensus::RaftNode;
use crate::error::ClusterError;
use crate::fsm::FsmCommand;
use crate::store::AssignmentStore;

/// Capacity of the reconcile channel; sends are non-blocking and drops are
/// tolerated because the ticker re-reconciles anyway.
pub const RECONCILE_CHANNEL_CAPACITY: usize = 32;

/// The leader-only reconciler.
///
/// Driven by a periodic ticker and by membership events, it partitions the
/// parsing-config namespace across the live members and proposes the
/// assignment diff through consensus. All proposals are fire-and-forget:
/// correctness comes from the next pass re-diffing against the store.
pub struct AssignmentEngine {
    members_rx: watch::Receiver<BTreeMap<NodeName, ClusterMember>>,
    raft: Arc<RaftNode>,
    store: Arc<AssignmentStore>,
    repository: Repository,
    update_interval: Duration,
    reconcile_rx: mpsc::Receiver<ClusterMember>,
    shutdown: CancellationToken,
}

impl AssignmentEngine {
    pub fn new(
        members_rx: watch::Receiver<BTreeMap<NodeName, ClusterMember>>,
        raft: Arc<RaftNode>,
        store: Arc<AssignmentStore>,
        repository: Repository,
        update_interval: Duration,
        reconcile_rx: mpsc::Receiver<ClusterMember>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            members_rx,
            raft,
            store,
            repository,
            update_interval,
            reconcile_rx,
            shutdown,
        }
    }

    /// Runs until shutdown. The ticker and the reconcile channel are
    /// serialised through one select so at most one pass runs at a time.
    pub async fn run(mut self) {
        info!(interval = ?self.update_interval, "Assignment engine started.");
        let mut ticker = tokio::time::interval(self.update_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                member = self.reconcile_rx.recv() => {
                    match member {
                        Some(member) => {
                            debug!(name = %member.name, status = ?member.status, "Reconcile event.");
                        },
                        None => break,
                    }
                },
                _ = self.shutdown.cancelled() => break,
            }

            if !self.raft.is_leader() {
                continue;
            }
            if let Err(error) = self.reconcile_once().await {
                warn!(error = %error, "Reconcile pass failed.");
            }
        }
        info!("Assignment engine stopped.");
    }

    /// One reconcile pass: compute the target partition and propose the diff.
    async fn reconcile_once(&self) -> Result<(), ClusterError> {
        let hosts: Vec<String> = self.members_rx.borrow().keys().cloned().collect();

        let configs = self.repository.list_parsing_configs()?;
        let target = partition(&configs, &hosts);

        for host in &hosts {
            self.store.touch(host);
        }
        self.store.retain_hosts(&hosts);
        let current = self.store.dump();

        let mut assigned = 0usize;
        let mut removed = 0usize;

        for (host, wanted) in &target {
            for config in wanted {
                if !self.store.contains(host, config) {
                    // Leadership lost mid-pass: abort, the new leader re-runs
                    // from its own view.
                    if !self.raft.is_leader() {
                        return Ok(());
                    }
                    self.propose_logged(FsmCommand::AssignConfig {
                        host: host.clone(),
                        config: config.clone(),
                    })
                    .await;
                    assigned += 1;
                }
            }
        }

        for (host, held) in &current {
            let wanted = target.get(host);
            for config in held {
                let still_wanted = wanted.map(|w| w.contains(config)).unwrap_or(false);
                if !still_wanted {
                    if !self.raft.is_leader() {
                        return Ok(());
                    }
                    self.propose_logged(FsmCommand::RemoveConfig {
                        host: host.clone(),
                        config: config.clone(),
                    })
                    .await;
                    removed += 1;
                }
            }
        }

        if assigned > 0 || removed > 0 {
            info!(
                hosts = hosts.len(),
                configs = configs.len(),
                assigned = assigned,
                removed = removed,
                "Reconciled assignments."
            );
        }
        Ok(())
    }

    async fn propose_logged(&self, cmd: FsmCommand) {
        if let Err(error) = self.raft.propose(cmd).await {
            warn!(error = %error, "Failed to propose assignment command.");
        }
    }
}

/// Partitions sorted configs round-robin across sorted hosts.
///
/// Deterministic for a fixed `(hosts, configs)` pair, so leader flaps do not
/// thrash assignments, and balanced: host counts differ by at most one.
pub fn partition(configs: &[String], hosts: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut target: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if hosts.is_empty() {
        return target;
    }

    let mut sorted_hosts: Vec<&String> = hosts.iter().collect();
    sorted_hosts.sort();
    let mut sorted_configs: Vec<&String> = configs.iter().collect();
    sorted_configs.sort();

    for (idx, config) in sorted_configs.into_iter().enumerate() {
        let host = sorted_hosts[idx % sorted_hosts.len()];
        target.entry(host.clone()).or_default().push(config.clone());
    }
    target
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn partition_covers_each_config_exactly_once() {
        let configs = names(&["w", "x", "y", "z"]);
        let hosts = names(&["a", "b", "c"]);

        let target = partition(&configs, &hosts);

        let mut seen = BTreeSet::new();
        for assigned in target.values() {
            for config in assigned {
                assert!(seen.insert(config.clone()), "config assigned twice");
            }
        }
        assert_eq!(seen.len(), configs.len());
    }

    #[test]
    fn partition_is_balanced() {
        let configs = names(&["w", "x", "y", "z"]);
        let hosts = names(&["a", "b", "c"]);

        let target = partition(&configs, &hosts);
        let total: usize = target.values().map(Vec::len).sum();
        assert_eq!(total, 4);
        for assigned in target.values() {
            assert!((1..=2).contains(&assigned.len()));
        }
    }

    #[test]
    fn partition_is_stable() {
        let configs = names(&["c1", "c2", "c3", "c4", "c5"]);
        let hosts = names(&["a", "b"]);

        let first = partition(&configs, &hosts);
        let second = partition(&configs, &hosts);
        assert_eq!(first, second);

        // Input order must not matter.
        let shuffled = names(&["c5", "c3", "c1", "c4", "c2"]);
        let third = partition(&shuffled, &hosts);
        assert_eq!(first, third);
    }

    #[test]
    fn partition_with_no_hosts_is_empty() {
        let configs = names(&["c1", "c2"]);
        let target = partition(&configs, &[]);
        assert!(target.is_empty());
    }

    #[test]
    fn removed_host_gets_nothing() {
        let configs = names(&["c1", "c2", "c3"]);
        let before = partition(&configs, &names(&["a", "b", "c"]));
        assert!(before.contains_key("a"));

        let after = partition(&configs, &names(&["b", "c"]));
        assert!(!after.contains_key("a"));
        let total: usize = after.values().map(Vec::len).sum();
        assert_eq!(total, 3);
    }
}
