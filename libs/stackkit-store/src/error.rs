use std::path::PathBuf;

/// Errors raised by signed-directory operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store directory already exists: {0}")]
    AlreadyInstalled(PathBuf),

    #[error("no store marker found in {0}")]
    NotInstalled(PathBuf),

    #[error("store {dir} rejected signature '{name}': an incompatible entry is already registered")]
    SignatureConflict { dir: PathBuf, name: String },

    #[error("store marker in {0} is empty or unreadable")]
    CorruptMarker(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed signature ledger: {0}")]
    Ledger(#[from] serde_json::Error),
}
