//! # Combaine Worker
//!
//! The parse/aggregate side of the combaine pipeline:
//!
//! - the [`Worker`] dispatch abstraction used by task runners to enqueue
//!   parse and aggregate calls with per-call deadlines;
//! - the fetcher plugin registry with the `timetail` HTTP fetcher;
//! - the group-to-hosts resolver backed by the shared TTL cache;
//! - the gRPC [`WorkerService`] implementation served by the worker binary,
//!   its fetches coalesced through the same cache.

pub mod fetchers;
mod hosts;
mod service;
mod worker;

pub use hosts::{resolve_targets, HostResolver, HttpHostResolver, StaticHostResolver};
pub use service::WorkerService;
pub use worker::{
    GrpcWorker,
    Worker,
    WorkerError,
    WorkerReply,
    METHOD_AGGREGATING,
    METHOD_PARSING,
};
