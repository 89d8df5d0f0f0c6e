//! Outbound message sink

use crate::flow::ClientAddr;
use blobserver_core::Value;

/// OSC paths of the protocol.
pub mod paths {
    pub const CONNECT: &str = "/blobserver/connect";
    pub const DISCONNECT: &str = "/blobserver/disconnect";
    pub const SET_PARAMETER: &str = "/blobserver/setParameter";
    pub const GET_PARAMETER: &str = "/blobserver/getParameter";
    pub const DETECTORS: &str = "/blobserver/detectors";
    pub const SOURCES: &str = "/blobserver/sources";
    pub const START_FRAME: &str = "/blobserver/startFrame";
    pub const END_FRAME: &str = "/blobserver/endFrame";
}

/// Where command replies and per-frame envelopes go.
///
/// The control plane implements this over OSC; engine tests collect
/// messages in memory instead.
pub trait Publisher: Send + Sync {
    fn send(&self, to: &ClientAddr, path: &str, args: Vec<Value>);
}
