//! Error type for the bake pipeline

use thiserror::Error;

/// Errors raised while validating or running a bake.
///
/// Inside a running session these never reach the caller directly: the
/// scheduler logs them and turns the run into a cancellation.
#[derive(Debug, Error)]
pub enum BakeError {
    #[error("invalid bake settings: {0}")]
    InvalidSettings(String),

    #[error("session is {0:?}, operation not allowed")]
    InvalidState(crate::session::BakeState),

    #[error("bake panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PNG encoding error: {0}")]
    Png(#[from] png::EncodingError),
}

pub type Result<T> = std::result::Result<T, BakeError>;
