use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Path model error types.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O errors from filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A mutation was attempted on a node that has already been deleted.
    #[error("node already deleted: {}", .0.display())]
    NodeDeleted(PathBuf),

    /// An invalid search glob or text pattern was supplied.
    #[error("invalid pattern: {0}")]
    Pattern(String),

    /// A background task failed to run to completion.
    #[error("background task failed: {0}")]
    Task(String),
}
