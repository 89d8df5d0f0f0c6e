//! Flows: a source tuple bound to a detector and a subscriber

use blobserver_core::shm::ShmWriter;
use blobserver_vision::{Detector, Source};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A subscriber endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientAddr {
    pub host: String,
    pub port: u16,
}

impl ClientAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One running pipeline. The detector instance is owned exclusively;
/// the sources are shared with other flows through the registry.
pub struct Flow {
    pub id: u32,
    pub sources: Vec<Arc<Mutex<dyn Source>>>,
    /// Registry identities of `sources`, for referrer bookkeeping.
    pub source_ids: Vec<(String, i32)>,
    pub detector: Box<dyn Detector>,
    /// Where the per-frame blob stream goes.
    pub client: ClientAddr,
    pub run: bool,
    /// Output image segment, `<prefix>_<flow_id>`.
    pub shm: ShmWriter,
}
