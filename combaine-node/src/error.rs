use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{0}")]
    /// An error has occurred within Chitchat.
    ChitChat(String),

    #[error("{0}")]
    /// An IO error has occurred.
    IO(#[from] io::Error),
}
