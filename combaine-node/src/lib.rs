//! # Combaine Node
//!
//! The gossip membership layer used by the combaine agents.
//!
//! Every agent joins a [chitchat](https://docs.rs/chitchat) cluster under a
//! stable node name (its hostname by default). The layer exposes the current
//! set of live members, membership statistics, and a bounded stream of
//! derived membership events which the control plane feeds into its
//! reconciler.
//!
//! chitchat publishes watch-style live/dead sets rather than discrete
//! events, so [`MemberEvent`]s are derived by diffing successive snapshots:
//! a node appearing in the live set joins, a live node turning up dead has
//! failed, a dead node garbage-collected by the failure detector is reaped,
//! and a live node vanishing without passing through the dead set has left.
//! The event channel is bounded; consumers must reconcile against
//! [`MemberNode::members`] periodically instead of relying on seeing every
//! event.

mod error;
mod node;
mod statistics;

/// The gossip transports, re-exported for binaries and tests.
pub use chitchat::transport;
pub use chitchat::FailureDetectorConfig;
pub use error::NodeError;
pub use node::{
    ClusterMember,
    MemberEvent,
    MemberEventKind,
    MemberNode,
    MemberNodeConfig,
    MemberStatus,
    EVENT_CHANNEL_CAPACITY,
};
pub use statistics::MembershipStatistics;

/// Stable member identity: the hostname by default.
pub type NodeName = String;

pub static DEFAULT_CLUSTER_ID: &str = "combaine-cluster";
