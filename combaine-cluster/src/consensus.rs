use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest,
    AppendEntriesResponse,
    InstallSnapshotRequest,
    InstallSnapshotResponse,
    VoteRequest,
    VoteResponse,
};
use openraft::storage::Adaptor;
use openraft::{BasicNode, Config, ServerState};
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::ClusterError;
use crate::fsm::{raft_node_id, CombaineRaft, FsmCommand, RaftNodeId, RaftStore, TypeConfig};
use crate::network::HttpRaftNetwork;

const HEARTBEAT_INTERVAL_MS: u64 = if cfg!(test) { 100 } else { 500 };
const ELECTION_TIMEOUT_MIN_MS: u64 = if cfg!(test) { 300 } else { 1500 };
const ELECTION_TIMEOUT_MAX_MS: u64 = if cfg!(test) { 600 } else { 3000 };

/// The raft side of a combaine agent.
///
/// Wraps the openraft instance with leadership notifications, command
/// proposals and a best-effort shutdown. Transport is HTTP: the peer-facing
/// routes come from [`RaftNode::router`] and are served on the advertise
/// address at the configured raft port.
pub struct RaftNode {
    id: RaftNodeId,
    raft: CombaineRaft,
    leader_rx: watch::Receiver<bool>,
}

impl RaftNode {
    /// Creates the raft instance and, when no prior state exists, bootstraps
    /// a single-node configuration with self as the initial voter.
    pub async fn bootstrap(
        name: &str,
        advertise_addr: SocketAddr,
        store: Arc<RaftStore>,
    ) -> Result<Self, ClusterError> {
        let id = raft_node_id(name);
        info!(name = %name, id = %id, addr = %advertise_addr, "bootstrap: create raft.");

        let config = Config {
            cluster_name: "combaine".to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL_MS,
            election_timeout_min: ELECTION_TIMEOUT_MIN_MS,
            election_timeout_max: ELECTION_TIMEOUT_MAX_MS,
            ..Default::default()
        }
        .validate()
        .map_err(|e| ClusterError::Consensus(e.to_string()))?;

        let network = HttpRaftNetwork::default();
        let (log_store, state_machine) = Adaptor::new(store);
        let raft = CombaineRaft::new(id, Arc::new(config), network, log_store, state_machine)
            .await
            .map_err(|e| ClusterError::Consensus(e.to_string()))?;

        // First boot has no state: become a single-node cluster with self as
        // the initial voter. On recovery the call reports the existing
        // initialization, which is fine.
        let mut members = BTreeMap::new();
        members.insert(
            id,
            BasicNode {
                addr: advertise_addr.to_string(),
            },
        );
        if let Err(e) = raft.initialize(members).await {
            info!(error = %e, "bootstrap: raft is already initialized.");
        }

        let leader_rx = spawn_leadership_watcher(&raft);

        Ok(Self { id, raft, leader_rx })
    }

    #[inline]
    pub fn id(&self) -> RaftNodeId {
        self.id
    }

    /// Whether this node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        *self.leader_rx.borrow()
    }

    /// A channel observing leadership transitions: fires `true` on gaining
    /// leadership, `false` on losing it.
    pub fn leader_watcher(&self) -> watch::Receiver<bool> {
        self.leader_rx.clone()
    }

    /// Waits until this node is the leader, for tests and startup probes.
    pub async fn wait_for_leadership(&self, timeout_after: Duration) -> Result<(), ClusterError> {
        let mut rx = self.leader_rx.clone();
        tokio::time::timeout(timeout_after, async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|_| ClusterError::Consensus("timed out waiting for leadership".to_string()))
    }

    /// Proposes a command to the replicated log.
    ///
    /// Callers treat failures as retriable: the reconciler re-proposes on its
    /// next pass.
    pub async fn propose(&self, cmd: FsmCommand) -> Result<(), ClusterError> {
        self.raft
            .client_write(cmd)
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::Consensus(e.to_string()))
    }

    /// Routes serving the raft RPC endpoints for peers.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/raft/append", post(append))
            .route("/raft/snapshot", post(snapshot))
            .route("/raft/vote", post(vote))
            .with_state(self.raft.clone())
    }

    /// Best-effort shutdown; errors are logged and swallowed.
    pub async fn shutdown(&self) {
        info!("Shutdown raft.");
        if let Err(e) = self.raft.shutdown().await {
            error!(error = %e, "Failed to shutdown raft.");
        }
    }
}

fn spawn_leadership_watcher(raft: &CombaineRaft) -> watch::Receiver<bool> {
    let mut metrics = raft.metrics();
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut was_leader = false;
        loop {
            let is_leader = metrics.borrow().state == ServerState::Leader;
            if is_leader != was_leader {
                was_leader = is_leader;
                info!(is_leader = is_leader, "Leadership changed.");
                if tx.send(is_leader).is_err() {
                    break;
                }
            }
            if metrics.changed().await.is_err() {
                break;
            }
        }
    });

    rx
}

/// Creates `<data_dir>/raft/` (0755) for stores that persist state. The
/// default in-memory store writes nothing but the directory is kept so a
/// persistent store is a drop-in swap.
pub fn ensure_state_dir(data_dir: &Path) -> Result<PathBuf, ClusterError> {
    let dir = data_dir.join("raft");
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        if !dir.is_dir() {
            fs::DirBuilder::new().recursive(true).mode(0o755).create(&dir)?;
        }
    }
    #[cfg(not(unix))]
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

async fn append(
    State(raft): State<CombaineRaft>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<RaftNodeId>, RaftError<RaftNodeId>>> {
    Json(raft.append_entries(req).await)
}

async fn snapshot(
    State(raft): State<CombaineRaft>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<RaftNodeId>, RaftError<RaftNodeId, InstallSnapshotError>>>
{
    Json(raft.install_snapshot(req).await)
}

async fn vote(
    State(raft): State<CombaineRaft>,
    Json(req): Json<VoteRequest<RaftNodeId>>,
) -> Json<Result<VoteResponse<RaftNodeId>, RaftError<RaftNodeId>>> {
    Json(raft.vote(req).await)
}
