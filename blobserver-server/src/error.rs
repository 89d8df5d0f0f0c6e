//! Error types for blobserver-server

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    /// The control-plane endpoint could not be bound. Fatal: the
    /// process exits non-zero.
    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Core(#[from] blobserver_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = ServerError::Bind("port 9002 in use".to_string());
        assert!(err.to_string().contains("Bind error"));
        assert!(err.to_string().contains("9002"));
    }
}
