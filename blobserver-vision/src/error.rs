//! Error types for blobserver-vision

use blobserver_core::Error as CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Source error: {0}")]
    Source(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("{0}")]
    Parameter(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<VisionError> for CoreError {
    fn from(err: VisionError) -> Self {
        match err {
            VisionError::Parameter(msg) => CoreError::Validation(msg),
            VisionError::Source(msg) => CoreError::Source(msg),
            VisionError::Detector(msg) => CoreError::Detector(msg),
            VisionError::Image(e) => CoreError::Image(e),
            VisionError::Core(e) => e,
        }
    }
}
