//! # Combaine RPC
//!
//! Protobuf wire types and gRPC client/server scaffolding shared by the
//! combaine agents, workers and senders.
//!
//! The `combaine_rpc` module is generated from `proto/combaine.proto` and
//! checked in, so builds do not require `protoc`.

mod combaine_rpc;

pub use combaine_rpc::*;
