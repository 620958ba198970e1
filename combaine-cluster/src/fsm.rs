use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    BasicNode,
    Entry,
    EntryPayload,
    LogId,
    OptionalSend,
    RaftStorage,
    SnapshotMeta,
    StorageError,
    StorageIOError,
    StoredMembership,
    Vote,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::store::AssignmentStore;

/// Raft server id, derived from the node name.
pub type RaftNodeId = u64;

openraft::declare_raft_types!(
    /// Raft type configuration for the replicated assignment log.
    pub TypeConfig:
        D = FsmCommand,
        R = FsmResponse,
        NodeId = RaftNodeId,
        Node = BasicNode,
);

pub type CombaineRaft = openraft::Raft<TypeConfig>;

/// Commands replicated through the raft log. Applied atomically and
/// deterministically on every replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum FsmCommand {
    AssignConfig { host: String, config: String },
    RemoveConfig { host: String, config: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FsmResponse {}

/// What the state machine needs from its surroundings: the assignment store,
/// the local node name, and the callback that spawns a task runner when an
/// assignment lands here. The cluster owns the FSM, not the other way round.
#[derive(Clone)]
pub struct FsmContext {
    pub store: Arc<AssignmentStore>,
    pub node_name: String,
    pub spawn_task: Arc<dyn Fn(String, CancellationToken) + Send + Sync>,
}

impl FsmContext {
    fn apply(&self, cmd: &FsmCommand) {
        info!(cmd = ?cmd, "fsm: apply command.");
        match cmd {
            FsmCommand::AssignConfig { host, config } => {
                let token = self.store.put(host, config);
                if host == &self.node_name {
                    (self.spawn_task)(config.clone(), token);
                }
            },
            FsmCommand::RemoveConfig { host, config } => {
                self.store.remove(host, config);
            },
        }
    }
}

/// Serialized form of the state machine, stored in raft snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SnapshotContent {
    last_applied: Option<LogId<RaftNodeId>>,
    last_membership: StoredMembership<RaftNodeId, BasicNode>,
    assignments: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<RaftNodeId, BasicNode>,
    data: Vec<u8>,
}

/// Combined in-memory log and state machine storage.
///
/// The log, vote and snapshot live here; the applied state itself is the
/// shared [`AssignmentStore`] reached through the [`FsmContext`]. A
/// persistent store is a drop-in swap of this type.
pub struct RaftStore {
    ctx: FsmContext,
    vote: RwLock<Option<Vote<RaftNodeId>>>,
    log: RwLock<BTreeMap<u64, Entry<TypeConfig>>>,
    last_purged: RwLock<Option<LogId<RaftNodeId>>>,
    last_applied: RwLock<Option<LogId<RaftNodeId>>>,
    last_membership: RwLock<StoredMembership<RaftNodeId, BasicNode>>,
    snapshot: RwLock<Option<StoredSnapshot>>,
}

impl RaftStore {
    pub fn new(ctx: FsmContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            vote: RwLock::new(None),
            log: RwLock::new(BTreeMap::new()),
            last_purged: RwLock::new(None),
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
            snapshot: RwLock::new(None),
        })
    }
}

impl RaftLogReader<TypeConfig> for Arc<RaftStore> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, entry)| entry.clone()).collect())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<RaftStore> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<RaftNodeId>> {
        info!("fsm: make snapshot.");
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();

        let content = SnapshotContent {
            last_applied,
            last_membership: membership.clone(),
            assignments: self.ctx.store.dump(),
        };
        let data = serde_json::to_vec(&content)
            .map_err(|e| StorageIOError::write_snapshot(None, &e))?;

        let snapshot_id = last_applied
            .map(|id| format!("{}-{}", id.leader_id, id.index))
            .unwrap_or_else(|| "0-0".to_string());
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        *self.snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for Arc<RaftStore> {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        let last = log.iter().next_back().map(|(_, entry)| entry.log_id);
        let purged = *self.last_purged.read().await;

        Ok(LogState {
            last_purged_log_id: purged,
            last_log_id: last.or(purged),
        })
    }

    async fn save_vote(&mut self, vote: &Vote<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Arc::clone(self)
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        *self.last_purged.write().await = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (Option<LogId<RaftNodeId>>, StoredMembership<RaftNodeId, BasicNode>),
        StorageError<RaftNodeId>,
    > {
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<FsmResponse>, StorageError<RaftNodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            *self.last_applied.write().await = Some(entry.log_id);

            match &entry.payload {
                EntryPayload::Blank => {},
                EntryPayload::Normal(cmd) => {
                    // A malformed or otherwise poisonous command must not
                    // take the state machine down with it.
                    let applied = catch_unwind(AssertUnwindSafe(|| self.ctx.apply(cmd)));
                    if applied.is_err() {
                        error!(cmd = ?cmd, "fsm: panic while applying raft command.");
                    }
                },
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                },
            }
            responses.push(FsmResponse {});
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        info!(snapshot_id = %meta.snapshot_id, "fsm: restore snapshot.");
        let data = snapshot.into_inner();
        let content: SnapshotContent = serde_json::from_slice(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        *self.last_applied.write().await = content.last_applied;
        *self.last_membership.write().await = content.last_membership;

        // Rebuild the assignment store exactly as apply would have, including
        // starting task runners for assignments that land on this node.
        self.ctx.store.clear();
        for (host, configs) in &content.assignments {
            for config in configs {
                let token = self.ctx.store.put(host, config);
                if host == &self.ctx.node_name {
                    info!(config = %config, "fsm: restore local task.");
                    (self.ctx.spawn_task)(config.clone(), token);
                }
            }
        }

        *self.snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<RaftNodeId>> {
        let snapshot = self.snapshot.read().await;
        Ok(snapshot.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}

/// Stable 64-bit id for a node name, FNV-1a. Deterministic across the whole
/// cluster so every member derives the same raft id for a given hostname.
pub fn raft_node_id(name: &str) -> RaftNodeId {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x1000_0000_01b3;

    let mut hash = OFFSET;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use openraft::CommittedLeaderId;

    use super::*;

    fn log_id(term: u64, index: u64) -> LogId<RaftNodeId> {
        LogId::new(CommittedLeaderId::new(term, 0), index)
    }

    fn entry(term: u64, index: u64, cmd: FsmCommand) -> Entry<TypeConfig> {
        Entry {
            log_id: log_id(term, index),
            payload: EntryPayload::Normal(cmd),
        }
    }

    fn assign(host: &str, config: &str) -> FsmCommand {
        FsmCommand::AssignConfig {
            host: host.to_string(),
            config: config.to_string(),
        }
    }

    fn remove(host: &str, config: &str) -> FsmCommand {
        FsmCommand::RemoveConfig {
            host: host.to_string(),
            config: config.to_string(),
        }
    }

    fn test_store(node_name: &str) -> (Arc<RaftStore>, Arc<Mutex<Vec<String>>>) {
        let spawned = Arc::new(Mutex::new(Vec::new()));
        let spawned_clone = spawned.clone();
        let ctx = FsmContext {
            store: Arc::new(AssignmentStore::new()),
            node_name: node_name.to_string(),
            spawn_task: Arc::new(move |config, _token| {
                spawned_clone.lock().unwrap().push(config);
            }),
        };
        (RaftStore::new(ctx), spawned)
    }

    #[tokio::test]
    async fn apply_assign_and_remove() {
        let (store, spawned) = test_store("b");
        let mut raft_store = Arc::clone(&store);

        raft_store
            .apply_to_state_machine(&[
                entry(1, 1, assign("a", "c1")),
                entry(1, 2, assign("b", "c2")),
                entry(1, 3, remove("a", "c1")),
            ])
            .await
            .unwrap();

        let dump = store.ctx.store.dump();
        assert_eq!(dump.get("a").map(Vec::len), Some(0));
        assert_eq!(dump["b"], vec!["c2"]);
        // Only the local assignment spawned a runner.
        assert_eq!(*spawned.lock().unwrap(), vec!["c2".to_string()]);
    }

    #[tokio::test]
    async fn apply_is_deterministic_across_replicas() {
        let commands = vec![
            assign("a", "c1"),
            assign("a", "c2"),
            assign("b", "c3"),
            remove("a", "c2"),
            assign("b", "c3"),
        ];

        let (first, _) = test_store("none");
        let (second, _) = test_store("none");
        for (store, _) in [(&first, 0), (&second, 0)] {
            let mut raft_store = Arc::clone(store);
            let entries: Vec<Entry<TypeConfig>> = commands
                .iter()
                .enumerate()
                .map(|(i, cmd)| entry(1, i as u64 + 1, cmd.clone()))
                .collect();
            raft_store.apply_to_state_machine(&entries).await.unwrap();
        }

        assert_eq!(first.ctx.store.dump(), second.ctx.store.dump());
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_assignments() {
        let (source, _) = test_store("nobody");
        let mut source_store = Arc::clone(&source);
        source_store
            .apply_to_state_machine(&[
                entry(1, 1, assign("a", "c1")),
                entry(1, 2, assign("a", "c2")),
                entry(1, 3, assign("b", "c3")),
            ])
            .await
            .unwrap();

        let snapshot = source_store.build_snapshot().await.unwrap();

        // Restore into a node named "b": one runner spawns, for c3.
        let (target, spawned) = test_store("b");
        let mut target_store = Arc::clone(&target);
        target_store
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert_eq!(target.ctx.store.dump(), source.ctx.store.dump());
        assert_eq!(*spawned.lock().unwrap(), vec!["c3".to_string()]);
    }

    #[tokio::test]
    async fn restore_cancels_previous_assignments() {
        let (source, _) = test_store("nobody");
        let mut source_store = Arc::clone(&source);
        source_store
            .apply_to_state_machine(&[entry(1, 1, assign("a", "c1"))])
            .await
            .unwrap();
        let snapshot = source_store.build_snapshot().await.unwrap();

        let (target, _) = test_store("nobody");
        let stale = target.ctx.store.put("z", "old");
        let mut target_store = Arc::clone(&target);
        target_store
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert!(stale.is_cancelled());
        assert!(!target.ctx.store.contains("z", "old"));
        assert!(target.ctx.store.contains("a", "c1"));
    }

    #[tokio::test]
    async fn log_state_tracks_appends() {
        let (store, _) = test_store("a");
        let mut raft_store = Arc::clone(&store);

        raft_store
            .append_to_log(vec![Entry::<TypeConfig> {
                log_id: log_id(1, 1),
                payload: EntryPayload::Blank,
            }])
            .await
            .unwrap();

        let state = raft_store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 1)));
    }

    #[tokio::test]
    async fn vote_round_trips() {
        let (store, _) = test_store("a");
        let mut raft_store = Arc::clone(&store);

        let vote = Vote::new(1, 1);
        raft_store.save_vote(&vote).await.unwrap();
        assert_eq!(raft_store.read_vote().await.unwrap(), Some(vote));
    }

    #[test]
    fn node_ids_are_stable_and_distinct() {
        assert_eq!(raft_node_id("combainer-1"), raft_node_id("combainer-1"));
        assert_ne!(raft_node_id("combainer-1"), raft_node_id("combainer-2"));
    }

    #[test]
    fn commands_serialize_with_a_type_tag() {
        let cmd = assign("a", "c1");
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"type\":\"AssignConfig\""));
        let decoded: FsmCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, cmd);
    }
}
