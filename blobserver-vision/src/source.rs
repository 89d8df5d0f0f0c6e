//! Source contract, geometric correction and the live-source registry

use crate::error::VisionError;
use blobserver_core::{Frame, Value};
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Capability set every video input implements.
///
/// One instance stands for one logical input (a device index, a named
/// segment). `grab` is called from the capture thread at ~1 kHz and
/// must stay cheap; `retrieve_corrected` never blocks and returns the
/// last grabbed frame with geometric correction applied.
pub trait Source: Send {
    /// Kind name, as registered with the source factory.
    fn kind(&self) -> &str;

    /// Device index within the kind.
    fn subsource(&self) -> i32;

    /// Idempotent device acquisition. False when the device is
    /// unavailable; this is the only failure surfaced to the control
    /// plane.
    fn connect(&mut self) -> bool;

    /// Pull the next frame into the internal buffer. A transient
    /// failure silently keeps the previous buffer.
    fn grab(&mut self);

    /// Latest corrected frame, or an empty frame of the declared size
    /// before anything was grabbed.
    fn retrieve_corrected(&self) -> Frame;

    fn get_parameter(&self, name: &str) -> Result<Value, VisionError>;

    fn set_parameter(&mut self, name: &str, value: Value) -> Result<(), VisionError>;

    /// Device indices available for this kind.
    fn subsources(&self) -> Vec<i32>;
}

/// 3x3 geometric correction applied between the raw buffer and
/// `retrieve_corrected`. Identity by default; coefficients are exposed
/// as parameters `c00`..`c22`.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionMatrix {
    m: [f32; 9],
}

impl Default for CorrectionMatrix {
    fn default() -> Self {
        Self {
            m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl CorrectionMatrix {
    pub const PARAM_NAMES: [&'static str; 9] = [
        "c00", "c01", "c02", "c10", "c11", "c12", "c20", "c21", "c22",
    ];

    fn index(name: &str) -> Option<usize> {
        Self::PARAM_NAMES.iter().position(|n| *n == name)
    }

    pub fn is_identity(&self) -> bool {
        self.m == CorrectionMatrix::default().m
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        Self::index(name).map(|i| self.m[i])
    }

    pub fn set(&mut self, name: &str, value: f32) -> bool {
        match Self::index(name) {
            Some(i) => {
                self.m[i] = value;
                true
            }
            None => false,
        }
    }

    fn inverse(&self) -> Option<[f32; 9]> {
        let m = &self.m;
        let det = m[0] * (m[4] * m[8] - m[5] * m[7]) - m[1] * (m[3] * m[8] - m[5] * m[6])
            + m[2] * (m[3] * m[7] - m[4] * m[6]);
        if det.abs() < 1e-9 {
            return None;
        }
        let inv_det = 1.0 / det;
        Some([
            (m[4] * m[8] - m[5] * m[7]) * inv_det,
            (m[2] * m[7] - m[1] * m[8]) * inv_det,
            (m[1] * m[5] - m[2] * m[4]) * inv_det,
            (m[5] * m[6] - m[3] * m[8]) * inv_det,
            (m[0] * m[8] - m[2] * m[6]) * inv_det,
            (m[2] * m[3] - m[0] * m[5]) * inv_det,
            (m[3] * m[7] - m[4] * m[6]) * inv_det,
            (m[1] * m[6] - m[0] * m[7]) * inv_det,
            (m[0] * m[4] - m[1] * m[3]) * inv_det,
        ])
    }

    /// Warp a frame through the matrix with nearest-neighbour
    /// sampling. Out-of-range pixels come out black; a singular matrix
    /// leaves the frame untouched.
    pub fn apply(&self, raw: &RgbImage) -> RgbImage {
        if self.is_identity() {
            return raw.clone();
        }
        let Some(inv) = self.inverse() else {
            return raw.clone();
        };
        let (width, height) = raw.dimensions();
        RgbImage::from_fn(width, height, |x, y| {
            let (xf, yf) = (x as f32, y as f32);
            let w = inv[6] * xf + inv[7] * yf + inv[8];
            if w.abs() < 1e-9 {
                return image::Rgb([0, 0, 0]);
            }
            let sx = (inv[0] * xf + inv[1] * yf + inv[2]) / w;
            let sy = (inv[3] * xf + inv[4] * yf + inv[5]) / w;
            let (sx, sy) = (sx.round() as i64, sy.round() as i64);
            if sx < 0 || sy < 0 || sx >= width as i64 || sy >= height as i64 {
                image::Rgb([0, 0, 0])
            } else {
                *raw.get_pixel(sx as u32, sy as u32)
            }
        })
    }
}

struct SourceEntry {
    kind: String,
    subsource: i32,
    /// Registration id, monotonic per registry, for logs.
    id: u32,
    /// Flows currently referencing the source. The entry is reclaimed
    /// on the capture tick that finds this at zero.
    referrers: usize,
    source: Arc<Mutex<dyn Source>>,
}

/// The live sources, shared by flows, the capture thread and the
/// processing loop.
///
/// The registry lock is the engine's "sources lock"; whenever both are
/// needed it is taken before the flows lock. Referrer counts are
/// explicit: one per flow source slot, added when the flow acquires
/// the source and dropped when the flow goes away.
pub struct SourceRegistry {
    entries: Mutex<Vec<SourceEntry>>,
    next_id: Mutex<u32>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Add one referrer to an existing entry and hand out its source.
    pub fn acquire_existing(&self, kind: &str, subsource: i32) -> Option<Arc<Mutex<dyn Source>>> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.kind == kind && e.subsource == subsource)?;
        entry.referrers += 1;
        Some(Arc::clone(&entry.source))
    }

    /// Insert a freshly-connected source with one referrer held by the
    /// caller.
    pub fn insert(&self, source: Arc<Mutex<dyn Source>>) {
        let (kind, subsource) = {
            let guard = source.lock();
            (guard.kind().to_string(), guard.subsource())
        };
        let id = {
            let mut next_id = self.next_id.lock();
            let id = *next_id;
            *next_id += 1;
            id
        };
        info!(kind = %kind, subsource, id, "Source registered");
        self.entries.lock().push(SourceEntry {
            kind,
            subsource,
            id,
            referrers: 1,
            source,
        });
    }

    /// Drop one referrer. The entry stays until the next capture tick.
    pub fn release(&self, kind: &str, subsource: i32) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.kind == kind && e.subsource == subsource)
        {
            entry.referrers = entry.referrers.saturating_sub(1);
        }
    }

    /// Resolve by identity without touching the referrer count. Used
    /// by detector back-references; absent means reclaimed.
    pub fn resolve(&self, kind: &str, subsource: i32) -> Option<Arc<Mutex<dyn Source>>> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| e.kind == kind && e.subsource == subsource)
            .map(|e| Arc::clone(&e.source))
    }

    /// One capture tick: grab every source, then reclaim entries no
    /// flow references any more.
    pub fn grab_all_and_reclaim(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.iter() {
            entry.source.lock().grab();
        }
        entries.retain(|entry| {
            if entry.referrers == 0 {
                info!(
                    kind = %entry.kind,
                    subsource = entry.subsource,
                    id = entry.id,
                    "Source no longer used, disconnecting"
                );
                false
            } else {
                true
            }
        });
    }

    /// Synchronizing retrieve pass of the processing loop: one
    /// corrected frame per registered source, under a single hold of
    /// the lock.
    pub fn retrieve_all(&self) -> Vec<Frame> {
        let entries = self.entries.lock();
        entries
            .iter()
            .map(|e| e.source.lock().retrieve_corrected())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Non-owning reference from a detector back to one of its sources,
/// for closed-loop control (exposure, framerate).
///
/// Resolution goes through the registry by identity on every call, so
/// the handle never extends the source's lifetime. Once the source is
/// reclaimed the handle resolves to nothing and calls are dropped.
#[derive(Clone)]
pub struct SourceHandle {
    registry: Weak<SourceRegistry>,
    kind: String,
    subsource: i32,
}

impl SourceHandle {
    pub fn new(registry: &Arc<SourceRegistry>, kind: &str, subsource: i32) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            kind: kind.to_string(),
            subsource,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn subsource(&self) -> i32 {
        self.subsource
    }

    pub fn set_parameter(&self, name: &str, value: Value) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        match registry.resolve(&self.kind, self.subsource) {
            Some(source) => {
                if let Err(e) = source.lock().set_parameter(name, value) {
                    debug!(kind = %self.kind, name, "Back-reference write refused: {}", e);
                }
            }
            None => debug!(
                kind = %self.kind,
                subsource = self.subsource,
                "Back-reference to reclaimed source, dropping write"
            ),
        }
    }

    pub fn get_parameter(&self, name: &str) -> Option<Value> {
        let registry = self.registry.upgrade()?;
        let source = registry.resolve(&self.kind, self.subsource)?;
        let value = source.lock().get_parameter(name);
        value.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::PatternSource;

    fn registry_with_pattern(subsource: i32) -> Arc<SourceRegistry> {
        let registry = Arc::new(SourceRegistry::new());
        let mut source = PatternSource::new(subsource);
        assert!(source.connect());
        registry.insert(Arc::new(Mutex::new(source)));
        registry
    }

    #[test]
    fn test_registry_acquire_existing() {
        let registry = registry_with_pattern(0);
        assert!(registry.acquire_existing("Pattern", 0).is_some());
        assert!(registry.acquire_existing("Pattern", 1).is_none());
        assert!(registry.acquire_existing("Shm", 0).is_none());
    }

    #[test]
    fn test_registry_reclaims_unreferenced() {
        let registry = registry_with_pattern(0);
        assert_eq!(registry.len(), 1);

        // Still referenced: survives the tick.
        registry.grab_all_and_reclaim();
        assert_eq!(registry.len(), 1);

        registry.release("Pattern", 0);
        assert_eq!(registry.len(), 1);
        registry.grab_all_and_reclaim();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_shared_referrers() {
        let registry = registry_with_pattern(0);
        registry.acquire_existing("Pattern", 0).unwrap();

        // Two referrers: one release is not enough.
        registry.release("Pattern", 0);
        registry.grab_all_and_reclaim();
        assert_eq!(registry.len(), 1);

        registry.release("Pattern", 0);
        registry.grab_all_and_reclaim();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handle_noop_after_reclaim() {
        let registry = registry_with_pattern(0);
        let handle = SourceHandle::new(&registry, "Pattern", 0);
        assert!(handle.get_parameter("width").is_some());

        registry.release("Pattern", 0);
        registry.grab_all_and_reclaim();
        assert!(handle.get_parameter("width").is_none());
        // Writes to a reclaimed source are dropped, not an error.
        handle.set_parameter("width", Value::Int(64));
    }

    #[test]
    fn test_correction_identity_passthrough() {
        let raw = RgbImage::from_pixel(4, 4, image::Rgb([9, 8, 7]));
        let correction = CorrectionMatrix::default();
        assert!(correction.is_identity());
        assert_eq!(correction.apply(&raw).as_raw(), raw.as_raw());
    }

    #[test]
    fn test_correction_translation() {
        let mut raw = RgbImage::new(4, 4);
        raw.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        let mut correction = CorrectionMatrix::default();
        // Shift right by one pixel.
        assert!(correction.set("c02", 1.0));
        let corrected = correction.apply(&raw);
        assert_eq!(corrected.get_pixel(1, 0).0, [255, 0, 0]);
        assert_eq!(corrected.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_correction_unknown_coefficient() {
        let mut correction = CorrectionMatrix::default();
        assert!(!correction.set("c33", 1.0));
        assert!(correction.get("c33").is_none());
    }
}
