//! # Combaine
//! Distributed aggregation and monitoring-dispatch system.
//!
//! This is a convenience package which re-exports the sub-projects within
//! Combaine; realistically you probably only want some of these:
//!
//! - `combaine_node` - gossip membership over chitchat.
//! - `combaine_cluster` - the control plane: replicated assignments, the
//!   leader-only assignment engine and the task runners.
//! - `combaine_cache` - the single-flight TTL cache shared by fetchers.
//! - `combaine_repository` - the filesystem configuration repository.
//! - `combaine_rpc` - protobuf wire types and gRPC scaffolding.
//! - `combaine_worker` - worker dispatch, fetcher plugins and the worker
//!   service.

pub use combaine_cache as cache;
pub use combaine_cluster as cluster;
pub use combaine_node as node;
pub use combaine_repository as repository;
pub use combaine_rpc as rpc;
pub use combaine_worker as worker;
