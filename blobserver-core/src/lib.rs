//! blobserver-core: shared types for the blobserver workspace
//!
//! Tagged parameter values, reference-counted frame buffers, the
//! shared-memory segment layout used for output images, server
//! configuration, and the workspace error type.

pub mod config;
pub mod error;
pub mod frame;
pub mod shm;
pub mod value;

pub use config::{FlowConfig, ServerConfig, SourceConfig, Transport};
pub use error::{Error, Result};
pub use frame::Frame;
pub use value::{ParamSchema, Value, ValueKind};

/// Port the control-plane server listens on.
pub const OSC_PORT: u16 = 9002;

/// Fixed port command replies are sent to on the client host.
pub const REPLY_PORT: u16 = 9000;

/// Name prefix of output shared-memory segments.
pub const SHM_PREFIX: &str = "blobserver_output";
