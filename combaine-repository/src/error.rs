use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("missing repository directory: {0}")]
    MissingDirectory(PathBuf),

    #[error("missing {kind} config: {name}")]
    MissingConfig { kind: &'static str, name: String },

    #[error("malformed config {name}: {source}")]
    Malformed {
        name: String,
        source: serde_yaml::Error,
    },

    #[error("plugin section has no `type` field")]
    MissingPluginType,

    #[error("plugin config: {0}")]
    Encode(#[source] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}
