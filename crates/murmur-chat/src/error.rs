//! Error types for murmur-chat

use thiserror::Error;

/// Result type alias using murmur-chat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by orchestrator operations.
///
/// Remote and streaming failures are absorbed below this layer; what remains
/// is input the stores rejected.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] murmur_store::Error),
}

impl Error {
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Store(murmur_store::Error::Validation(_)))
    }
}
