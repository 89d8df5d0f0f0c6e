//! Class factories for detector and source kinds
//!
//! String kind to constructor, populated once at startup and read-only
//! afterwards. Two separate registries: one per contract.

use blobserver_core::{Error, Result};
use blobserver_vision::detectors::{LightSpotsDetector, MeanOutliersDetector, StitchDetector};
use blobserver_vision::sources::{PatternSource, ShmSource};
use blobserver_vision::{Detector, Source};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

type DetectorCtor = fn() -> Box<dyn Detector>;
type SourceCtor = fn(i32) -> Arc<Mutex<dyn Source>>;

/// Detector kind registry.
pub struct DetectorFactory {
    ctors: BTreeMap<&'static str, DetectorCtor>,
}

impl DetectorFactory {
    pub fn empty() -> Self {
        Self {
            ctors: BTreeMap::new(),
        }
    }

    /// All in-tree detector kinds.
    pub fn with_builtin_kinds() -> Self {
        let mut factory = Self::empty();
        factory.register("LightSpots", || Box::new(LightSpotsDetector::new()));
        factory.register("MeanOutliers", || Box::new(MeanOutliersDetector::new()));
        factory.register("Stitch", || Box::new(StitchDetector::new()));
        factory
    }

    pub fn register(&mut self, kind: &'static str, ctor: DetectorCtor) {
        self.ctors.insert(kind, ctor);
    }

    pub fn create(&self, kind: &str) -> Result<Box<dyn Detector>> {
        match self.ctors.get(kind) {
            Some(ctor) => Ok(ctor()),
            None => Err(Error::Validation("Detector type not recognized".to_string())),
        }
    }

    /// Registered kinds, sorted.
    pub fn list(&self) -> Vec<String> {
        self.ctors.keys().map(|k| k.to_string()).collect()
    }
}

/// Source kind registry.
pub struct SourceFactory {
    ctors: BTreeMap<&'static str, SourceCtor>,
}

impl SourceFactory {
    pub fn empty() -> Self {
        Self {
            ctors: BTreeMap::new(),
        }
    }

    /// All in-tree source kinds.
    pub fn with_builtin_kinds() -> Self {
        let mut factory = Self::empty();
        factory.register("Pattern", |subsource| {
            Arc::new(Mutex::new(PatternSource::new(subsource)))
        });
        factory.register("Shm", |subsource| {
            Arc::new(Mutex::new(ShmSource::new(subsource)))
        });
        factory
    }

    pub fn register(&mut self, kind: &'static str, ctor: SourceCtor) {
        self.ctors.insert(kind, ctor);
    }

    pub fn create(&self, kind: &str, subsource: i32) -> Result<Arc<Mutex<dyn Source>>> {
        match self.ctors.get(kind) {
            Some(ctor) => Ok(ctor(subsource)),
            None => Err(Error::Validation(format!("Unable to create source {}", kind))),
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.ctors.keys().map(|k| k.to_string()).collect()
    }

    /// Device indices a kind reports, probed through a throwaway
    /// instance.
    pub fn subsources(&self, kind: &str) -> Result<Vec<i32>> {
        let probe = self.create(kind, -1)?;
        let subsources = probe.lock().subsources();
        Ok(subsources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_kinds_sorted() {
        let factory = DetectorFactory::with_builtin_kinds();
        assert_eq!(factory.list(), vec!["LightSpots", "MeanOutliers", "Stitch"]);
    }

    #[test]
    fn test_detector_unknown_kind() {
        let factory = DetectorFactory::with_builtin_kinds();
        match factory.create("Sobel") {
            Err(err) => assert!(err.to_string().contains("not recognized")),
            Ok(_) => panic!("expected create(\"Sobel\") to fail"),
        }
    }

    #[test]
    fn test_detector_create() {
        let factory = DetectorFactory::with_builtin_kinds();
        let detector = factory.create("Stitch").unwrap();
        assert_eq!(detector.required_source_count(), 2);
    }

    #[test]
    fn test_source_kinds_sorted() {
        let factory = SourceFactory::with_builtin_kinds();
        assert_eq!(factory.list(), vec!["Pattern", "Shm"]);
    }

    #[test]
    fn test_source_subsources_probe() {
        let factory = SourceFactory::with_builtin_kinds();
        assert_eq!(factory.subsources("Pattern").unwrap(), vec![0, 1, 2, 3]);
        assert!(factory.subsources("V4L2").is_err());
    }
}
