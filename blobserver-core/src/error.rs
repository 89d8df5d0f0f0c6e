//! Error types for blobserver

use thiserror::Error;

/// Workspace-level error type.
///
/// Command handlers never let these cross the control-plane boundary:
/// every failure is converted into a reply string for the issuing
/// client.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad command shape, unknown kind, wrong argument count. No state
    /// was mutated.
    #[error("{0}")]
    Validation(String),

    /// A device or segment could not be acquired. Partially-built
    /// state has been rolled back.
    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Shared memory error: {0}")]
    Shm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;
