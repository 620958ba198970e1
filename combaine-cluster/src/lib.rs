//! # Combaine Cluster
//!
//! The control plane of a combaine agent: gossip membership handling, the
//! raft-replicated assignment store, the leader-only assignment engine and
//! the per-config task runners.
//!
//! Data flow: membership events feed the reconciler; the leader partitions
//! the parsing-config namespace across live members and proposes the diff
//! through consensus; every replica applies the committed commands to its
//! assignment store; assignments landing on the local node spawn task
//! runners which drive the parse -> aggregate -> send cycle until their
//! cancellation token fires.

mod consensus;
mod dispatcher;
mod error;
mod fsm;
mod network;
mod runner;
mod senders;
mod stats;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use combaine_node::transport::Transport;
pub use consensus::{ensure_state_dir, RaftNode};
pub use dispatcher::{partition, AssignmentEngine, RECONCILE_CHANNEL_CAPACITY};
pub use error::ClusterError;
pub use fsm::{raft_node_id, CombaineRaft, FsmCommand, FsmContext, FsmResponse, RaftStore, TypeConfig};
pub use runner::{spawn_task_runner, RunnerContext};
pub use senders::SenderNetwork;
pub use stats::{ClientStats, StatsSnapshot};
pub use store::AssignmentStore;

use combaine_node::{
    ClusterMember,
    MemberEvent,
    MemberEventKind,
    MemberNode,
    MemberNodeConfig,
    NodeName,
};
use combaine_repository::Repository;
use combaine_worker::{HostResolver, Worker};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Cluster connection settings resolved by the binary from flags and the
/// repository's cluster config.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Stable node name, used as gossip identity and hashed into the raft id.
    pub name: NodeName,
    pub cluster_id: String,
    pub gossip_listen_addr: SocketAddr,
    pub gossip_public_addr: SocketAddr,
    /// Address peers use to reach the raft HTTP transport.
    pub raft_advertise_addr: SocketAddr,
    pub seed_nodes: Vec<String>,
    /// Cadence of the assignment engine's reconcile ticker.
    pub update_interval: Duration,
}

/// A bootstrapped combaine agent: gossip node, raft node, assignment store
/// and the background loops binding them together.
pub struct Cluster {
    name: NodeName,
    node: MemberNode,
    raft: Arc<RaftNode>,
    store: Arc<AssignmentStore>,
    stats: Arc<ClientStats>,
    shutdown: CancellationToken,
}

impl Cluster {
    /// Joins gossip, starts raft and spawns the event handler plus the
    /// assignment engine.
    ///
    /// Returns the cluster handle and the axum router carrying the raft RPC
    /// routes; the caller serves the router on the raft port.
    pub async fn bootstrap(
        options: ClusterOptions,
        repository: Repository,
        worker: Arc<dyn Worker>,
        resolver: Arc<dyn HostResolver>,
        transport: &dyn Transport,
    ) -> Result<(Self, Router), ClusterError> {
        info!(name = %options.name, seeds = ?options.seed_nodes, "Bootstrap cluster.");

        let shutdown = CancellationToken::new();
        let store = Arc::new(AssignmentStore::new());
        let stats = Arc::new(ClientStats::default());

        let runner_ctx = Arc::new(RunnerContext {
            repository: repository.clone(),
            worker,
            resolver,
            senders: SenderNetwork::default(),
            stats: stats.clone(),
            shutdown: shutdown.clone(),
        });

        let spawn_ctx = runner_ctx.clone();
        let fsm_ctx = FsmContext {
            store: store.clone(),
            node_name: options.name.clone(),
            spawn_task: Arc::new(move |config, token| {
                runner::spawn_task_runner(spawn_ctx.clone(), config, token);
            }),
        };
        let raft_store = RaftStore::new(fsm_ctx);
        let raft = Arc::new(
            RaftNode::bootstrap(&options.name, options.raft_advertise_addr, raft_store).await?,
        );
        let router = raft.router();

        let member_cfg = MemberNodeConfig {
            name: options.name.clone(),
            cluster_id: options.cluster_id.clone(),
            listen_addr: options.gossip_listen_addr,
            public_addr: options.gossip_public_addr,
            seed_nodes: options.seed_nodes.clone(),
            failure_detector: Default::default(),
        };
        let (node, events) = MemberNode::connect(member_cfg, transport).await?;

        let (reconcile_tx, reconcile_rx) = mpsc::channel(RECONCILE_CHANNEL_CAPACITY);
        tokio::spawn(handle_member_events(
            events,
            raft.clone(),
            reconcile_tx,
            shutdown.clone(),
        ));

        let engine = AssignmentEngine::new(
            node.members_watcher(),
            raft.clone(),
            store.clone(),
            repository,
            options.update_interval,
            reconcile_rx,
            shutdown.clone(),
        );
        tokio::spawn(engine.run());

        let cluster = Cluster {
            name: options.name,
            node,
            raft,
            store,
            stats,
            shutdown,
        };
        Ok((cluster, router))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this node is the current assignment leader.
    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Waits until this node gains leadership, for startup probes and tests.
    pub async fn wait_for_leadership(&self, timeout: Duration) -> Result<(), ClusterError> {
        self.raft.wait_for_leadership(timeout).await
    }

    /// Names of the alive gossip members, sorted.
    pub fn hosts(&self) -> Vec<NodeName> {
        self.node.member_names()
    }

    /// The alive gossip members, sorted by name.
    pub fn members(&self) -> Vec<ClusterMember> {
        self.node.members()
    }

    /// Number of configs assigned per host.
    pub fn distribution_statistic(&self) -> Vec<(String, usize)> {
        self.store.distribution_statistic()
    }

    /// Configs currently assigned to this node.
    pub fn local_assignments(&self) -> Vec<String> {
        self.store.list(&self.name)
    }

    #[inline]
    pub fn stats(&self) -> &Arc<ClientStats> {
        &self.stats
    }

    /// Graceful teardown: trip the shutdown signal first, then stop raft,
    /// then leave gossip. Individual failures are logged and skipped.
    pub async fn shutdown(self) {
        info!(name = %self.name, "Shutdown cluster.");
        self.shutdown.cancel();
        self.raft.shutdown().await;
        self.node.shutdown().await;
    }
}

/// Consumes derived membership events: logs transitions and, on the leader,
/// queues the affected members for reconciliation.
async fn handle_member_events(
    mut events: mpsc::Receiver<MemberEvent>,
    raft: Arc<RaftNode>,
    reconcile_tx: mpsc::Sender<ClusterMember>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        match event.kind {
            MemberEventKind::Join => {
                for member in &event.members {
                    info!(name = %member.name, "Member join event.");
                }
            },
            MemberEventKind::Leave | MemberEventKind::Fail => {
                for member in &event.members {
                    info!(name = %member.name, status = ?member.status, "Member failed event.");
                }
            },
            // Reaps reconcile silently.
            MemberEventKind::Reap => {},
            MemberEventKind::Update | MemberEventKind::User | MemberEventKind::Query => continue,
        }

        // Only the leader reconciles; everyone else observes the outcome
        // through the replicated log.
        if !raft.is_leader() {
            continue;
        }
        for member in event.members {
            if reconcile_tx.try_send(member).is_err() {
                debug!("Reconcile channel full. Dropping member event.");
            }
        }
    }
}
