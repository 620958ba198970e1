use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("config error: {0}")]
    Config(#[from] combaine_repository::RepositoryError),

    #[error("membership error: {0}")]
    Node(#[from] combaine_node::NodeError),

    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("encode error: {0}")]
    Encode(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
