//! blobserver-server: the flow engine and its OSC control plane
//!
//! The engine binds live sources to detector instances in flows, runs
//! a capture thread and a processing loop over them, and publishes
//! per-frame blob reports to remote subscribers. The control plane
//! translates inbound OSC messages into engine commands.

pub mod control;
pub mod engine;
pub mod error;
pub mod flow;
pub mod publish;
pub mod registry;

pub use control::{ControlPlane, OscPublisher};
pub use engine::FlowEngine;
pub use error::ServerError;
pub use flow::ClientAddr;
pub use publish::{paths, Publisher};
pub use registry::{DetectorFactory, SourceFactory};
