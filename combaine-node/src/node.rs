use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chitchat::transport::Transport;
use chitchat::{
    spawn_chitchat,
    Chitchat,
    ChitchatConfig,
    ChitchatHandle,
    FailureDetectorConfig,
    NodeId,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::statistics::MembershipStatistics;
use crate::{NodeError, NodeName};

/// Capacity of the derived member-event channel. Events beyond this are
/// dropped; consumers reconcile against [`MemberNode::members`] on a timer.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

const GOSSIP_INTERVAL: Duration = if cfg!(test) {
    Duration::from_millis(500)
} else {
    Duration::from_secs(1)
};

/// How often the derivation loop re-reads the dead set even without a
/// live-set change, so failure-detector reaps are noticed.
const MEMBERSHIP_POLL_INTERVAL: Duration = if cfg!(test) {
    Duration::from_millis(500)
} else {
    Duration::from_secs(2)
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
    /// Synthetic status for members garbage-collected by the failure
    /// detector; the assignment engine treats them as gone.
    Reap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    /// The stable name of the node in the cluster.
    pub name: NodeName,
    pub status: MemberStatus,
    /// The gossip address broadcast by the node.
    pub addr: SocketAddr,
}

impl ClusterMember {
    pub fn new(name: NodeName, status: MemberStatus, addr: SocketAddr) -> Self {
        Self { name, status, addr }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventKind {
    Join,
    Leave,
    Fail,
    Reap,
    Update,
    User,
    Query,
}

/// A membership transition affecting one or more members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEvent {
    pub kind: MemberEventKind,
    pub members: Vec<ClusterMember>,
}

/// Connection settings for the gossip layer.
pub struct MemberNodeConfig {
    /// Stable node name, the hostname by default.
    pub name: NodeName,
    pub cluster_id: String,
    /// The binding address for the gossip UDP socket.
    pub listen_addr: SocketAddr,
    /// The address broadcast to other cluster members.
    pub public_addr: SocketAddr,
    /// Seed nodes contacted to discover the rest of the cluster.
    pub seed_nodes: Vec<String>,
    pub failure_detector: FailureDetectorConfig,
}

/// A connected member of the gossip cluster.
pub struct MemberNode {
    pub me: ClusterMember,
    statistics: MembershipStatistics,
    chitchat_handle: ChitchatHandle,
    members: watch::Receiver<BTreeMap<NodeName, ClusterMember>>,
    stop: Arc<AtomicBool>,
}

impl MemberNode {
    /// Joins the gossip cluster and starts the membership derivation loop.
    ///
    /// Returns the node plus the bounded member-event stream.
    pub async fn connect(
        config: MemberNodeConfig,
        transport: &dyn Transport,
    ) -> Result<(Self, mpsc::Receiver<MemberEvent>), NodeError> {
        info!(
            cluster_id = %config.cluster_id,
            name = %config.name,
            public_addr = %config.public_addr,
            listen_gossip_addr = %config.listen_addr,
            peer_seed_addrs = %config.seed_nodes.join(", "),
            "Joining cluster."
        );

        let statistics = MembershipStatistics::default();
        statistics.num_live_members.store(1, Ordering::Relaxed);

        let me = ClusterMember::new(config.name.clone(), MemberStatus::Alive, config.public_addr);

        let chitchat_cfg = ChitchatConfig {
            node_id: NodeId::new(config.name.clone(), config.public_addr),
            cluster_id: config.cluster_id,
            gossip_interval: GOSSIP_INTERVAL,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes,
            failure_detector_config: config.failure_detector,
        };

        let chitchat_handle = spawn_chitchat(chitchat_cfg, Vec::new(), transport)
            .await
            .map_err(|e| NodeError::ChitChat(e.to_string()))?;

        let chitchat = chitchat_handle.chitchat();
        let initial_members =
            BTreeMap::from_iter([(me.name.clone(), me.clone())]);
        let (members_tx, members_rx) = watch::channel(initial_members);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));

        tokio::spawn(watch_membership(
            me.clone(),
            chitchat,
            members_tx,
            events_tx,
            statistics.clone(),
            stop.clone(),
        ));

        let node = MemberNode {
            me,
            statistics,
            chitchat_handle,
            members: members_rx,
            stop,
        };
        Ok((node, events_rx))
    }

    /// The current live members, sorted by name. Always contains self.
    pub fn members(&self) -> Vec<ClusterMember> {
        self.members.borrow().values().cloned().collect()
    }

    /// Names of the current live members, sorted.
    pub fn member_names(&self) -> Vec<NodeName> {
        self.members.borrow().keys().cloned().collect()
    }

    /// Returns a handle to the members watcher channel.
    pub fn members_watcher(&self) -> watch::Receiver<BTreeMap<NodeName, ClusterMember>> {
        self.members.clone()
    }

    #[inline]
    /// Get a handle to the live statistics.
    pub fn statistics(&self) -> MembershipStatistics {
        self.statistics.clone()
    }

    /// Leave the cluster.
    pub async fn shutdown(self) {
        info!(self_addr = ?self.me.addr, "Shutting down the gossip node.");
        self.stop.store(true, Ordering::Relaxed);
        if let Err(error) = self.chitchat_handle.shutdown().await {
            error!(self_addr = ?self.me.addr, error = ?error, "Error while shutting down.");
        }
    }

    /// Waits for the predicate to hold true for the cluster's members.
    pub async fn wait_for_members<F>(
        &self,
        mut predicate: F,
        timeout_after: Duration,
    ) -> Result<(), anyhow::Error>
    where
        F: FnMut(&BTreeMap<NodeName, ClusterMember>) -> bool,
    {
        tokio::time::timeout(
            timeout_after,
            WatchStream::new(self.members.clone())
                .skip_while(|members| !predicate(members))
                .next(),
        )
        .await?;
        Ok(())
    }
}

/// Derives membership events by diffing successive live/dead snapshots.
async fn watch_membership(
    me: ClusterMember,
    chitchat: Arc<Mutex<Chitchat>>,
    members_tx: watch::Sender<BTreeMap<NodeName, ClusterMember>>,
    events_tx: mpsc::Sender<MemberEvent>,
    statistics: MembershipStatistics,
    stop: Arc<AtomicBool>,
) {
    let mut live_watcher = chitchat.lock().await.live_nodes_watcher();
    let mut poll = tokio::time::interval(MEMBERSHIP_POLL_INTERVAL);
    let mut prev_live: BTreeSet<NodeId> = BTreeSet::new();
    let mut prev_dead: BTreeSet<NodeId> = BTreeSet::new();

    loop {
        let live: BTreeSet<NodeId> = tokio::select! {
            changed = live_watcher.next() => match changed {
                Some(live) => live.into_iter().collect(),
                None => break,
            },
            _ = poll.tick() => {
                chitchat.lock().await.live_nodes().cloned().collect()
            },
        };

        if stop.load(Ordering::Relaxed) {
            debug!("Received a stop signal. Stopping.");
            break;
        }

        let dead: BTreeSet<NodeId> = chitchat.lock().await.dead_nodes().cloned().collect();

        for event in diff_membership(&prev_live, &prev_dead, &live, &dead) {
            if events_tx.try_send(event).is_err() {
                debug!("Member event channel full. Dropping event.");
            }
        }

        let mut members: BTreeMap<NodeName, ClusterMember> = live
            .iter()
            .map(|id| {
                (
                    id.id.clone(),
                    ClusterMember::new(id.id.clone(), MemberStatus::Alive, id.gossip_public_address),
                )
            })
            .collect();
        members.insert(me.name.clone(), me.clone());

        statistics
            .num_live_members
            .store(members.len() as u64, Ordering::Relaxed);
        statistics
            .num_dead_members
            .store(dead.len() as u64, Ordering::Relaxed);

        if members_tx.send(members).is_err() {
            // The node has been dropped.
            error!("Failed to update members list. Stopping.");
            break;
        }

        prev_live = live;
        prev_dead = dead;
    }
}

/// Pure diff between two membership snapshots.
///
/// One event is produced per transition kind, carrying every member affected
/// by it, in the manner of serf-style member events.
fn diff_membership(
    prev_live: &BTreeSet<NodeId>,
    prev_dead: &BTreeSet<NodeId>,
    live: &BTreeSet<NodeId>,
    dead: &BTreeSet<NodeId>,
) -> Vec<MemberEvent> {
    let mut events = Vec::new();

    let joined: Vec<ClusterMember> = live
        .difference(prev_live)
        .map(|id| ClusterMember::new(id.id.clone(), MemberStatus::Alive, id.gossip_public_address))
        .collect();
    if !joined.is_empty() {
        events.push(MemberEvent {
            kind: MemberEventKind::Join,
            members: joined,
        });
    }

    let failed: Vec<ClusterMember> = dead
        .difference(prev_dead)
        .map(|id| ClusterMember::new(id.id.clone(), MemberStatus::Failed, id.gossip_public_address))
        .collect();
    if !failed.is_empty() {
        events.push(MemberEvent {
            kind: MemberEventKind::Fail,
            members: failed,
        });
    }

    let left: Vec<ClusterMember> = prev_live
        .iter()
        .filter(|id| !live.contains(id) && !dead.contains(id))
        .map(|id| ClusterMember::new(id.id.clone(), MemberStatus::Left, id.gossip_public_address))
        .collect();
    if !left.is_empty() {
        events.push(MemberEvent {
            kind: MemberEventKind::Leave,
            members: left,
        });
    }

    let reaped: Vec<ClusterMember> = prev_dead
        .iter()
        .filter(|id| !dead.contains(id) && !live.contains(id))
        .map(|id| ClusterMember::new(id.id.clone(), MemberStatus::Reap, id.gossip_public_address))
        .collect();
    if !reaped.is_empty() {
        events.push(MemberEvent {
            kind: MemberEventKind::Reap,
            members: reaped,
        });
    }

    events
}

#[cfg(test)]
mod tests {
    use chitchat::transport::ChannelTransport;

    use super::*;

    fn node_id(name: &str, port: u16) -> NodeId {
        NodeId::new(name.to_string(), ([127, 0, 0, 1], port).into())
    }

    fn set(ids: &[&NodeId]) -> BTreeSet<NodeId> {
        ids.iter().map(|id| (*id).clone()).collect()
    }

    #[test]
    fn diff_emits_join_for_new_live_node() {
        let a = node_id("a", 7001);
        let b = node_id("b", 7002);

        let events = diff_membership(
            &set(&[&a]),
            &BTreeSet::new(),
            &set(&[&a, &b]),
            &BTreeSet::new(),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MemberEventKind::Join);
        assert_eq!(events[0].members[0].name, "b");
        assert_eq!(events[0].members[0].status, MemberStatus::Alive);
    }

    #[test]
    fn diff_emits_fail_for_newly_dead_node() {
        let a = node_id("a", 7001);
        let b = node_id("b", 7002);

        let events =
            diff_membership(&set(&[&a, &b]), &BTreeSet::new(), &set(&[&a]), &set(&[&b]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MemberEventKind::Fail);
        assert_eq!(events[0].members[0].status, MemberStatus::Failed);
    }

    #[test]
    fn diff_emits_leave_for_vanished_live_node() {
        let a = node_id("a", 7001);
        let b = node_id("b", 7002);

        let events = diff_membership(
            &set(&[&a, &b]),
            &BTreeSet::new(),
            &set(&[&a]),
            &BTreeSet::new(),
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MemberEventKind::Leave);
        assert_eq!(events[0].members[0].status, MemberStatus::Left);
    }

    #[test]
    fn diff_emits_reap_for_collected_dead_node() {
        let a = node_id("a", 7001);
        let b = node_id("b", 7002);

        let events =
            diff_membership(&set(&[&a]), &set(&[&b]), &set(&[&a]), &BTreeSet::new());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MemberEventKind::Reap);
        assert_eq!(events[0].members[0].status, MemberStatus::Reap);
    }

    #[test]
    fn diff_reports_nothing_for_identical_snapshots() {
        let a = node_id("a", 7001);
        let b = node_id("b", 7002);

        let events =
            diff_membership(&set(&[&a, &b]), &BTreeSet::new(), &set(&[&a, &b]), &BTreeSet::new());
        assert!(events.is_empty());
    }

    fn test_config(name: &str, port: u16, seeds: Vec<String>) -> MemberNodeConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        MemberNodeConfig {
            name: name.to_string(),
            cluster_id: "test-cluster".to_string(),
            listen_addr: addr,
            public_addr: addr,
            seed_nodes: seeds,
            failure_detector: FailureDetectorConfig {
                phi_threshold: 6.0,
                initial_interval: GOSSIP_INTERVAL,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn single_node_sees_itself() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = ChannelTransport::default();
        let (node, _events) =
            MemberNode::connect(test_config("node-a", 7101, Vec::new()), &transport).await?;

        let members = node.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "node-a");
        assert_eq!(node.statistics().num_live_members(), 1);

        node.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn two_nodes_discover_each_other() -> anyhow::Result<()> {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = ChannelTransport::default();
        let (node_a, _events_a) =
            MemberNode::connect(test_config("node-a", 7111, Vec::new()), &transport).await?;
        let (node_b, mut events_b) = MemberNode::connect(
            test_config("node-b", 7112, vec!["127.0.0.1:7111".to_string()]),
            &transport,
        )
        .await?;

        let wait = Duration::from_secs(30);
        node_a.wait_for_members(|members| members.len() == 2, wait).await?;
        node_b.wait_for_members(|members| members.len() == 2, wait).await?;

        assert_eq!(node_a.member_names(), vec!["node-a", "node-b"]);

        // Node B observes node A joining at some point.
        let saw_join = tokio::time::timeout(wait, async {
            while let Some(event) = events_b.recv().await {
                if event.kind == MemberEventKind::Join
                    && event.members.iter().any(|m| m.name == "node-a")
                {
                    return true;
                }
            }
            false
        })
        .await?;
        assert!(saw_join);

        node_a.shutdown().await;
        node_b.shutdown().await;
        Ok(())
    }
}
