//! Bright light spot extraction

use super::components::{draw_cross, extract_components, luminance};
use crate::detector::{BlobReport, Detector, DetectorBase};
use crate::error::VisionError;
use crate::source::SourceHandle;
use crate::tracker::BlobTracker;
use crate::DEFAULT_LIFETIME;
use blobserver_core::{Frame, ParamSchema, Value, ValueKind};
use image::{GrayImage, Rgb, RgbImage};
use tracing::debug;

const SCHEMA: ParamSchema = ParamSchema::new(&[
    ("detectionLevel", ValueKind::Int),
    ("filterSize", ValueKind::Int),
    ("lifetime", ValueKind::Int),
    ("processNoise", ValueKind::Float),
    ("measurementNoise", ValueKind::Float),
]);

/// Extracts bright spots (projector dots, LEDs, torches) from a single
/// source and tracks them across frames.
///
/// Per-blob fields: `x y vx vy id`, all integers.
pub struct LightSpotsDetector {
    base: DetectorBase,
    tracker: BlobTracker,
    /// Minimum luminance for a pixel to count as lit.
    detection_level: i32,
    /// Components below `filterSize`^2 pixels are noise.
    filter_size: i32,
}

impl Default for LightSpotsDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl LightSpotsDetector {
    pub fn new() -> Self {
        Self {
            base: DetectorBase::new(),
            tracker: BlobTracker::new(DEFAULT_LIFETIME),
            detection_level: 200,
            filter_size: 3,
        }
    }

    fn report_from_tracker(&self) -> BlobReport {
        let mut report = BlobReport::empty();
        for blob in self.tracker.blobs() {
            let p = blob.properties();
            report.push_blob(vec![
                Value::Int(p.x),
                Value::Int(p.y),
                Value::Int(p.vx.round() as i32),
                Value::Int(p.vy.round() as i32),
                Value::Int(blob.id() as i32),
            ]);
        }
        report
    }
}

impl Detector for LightSpotsDetector {
    fn kind(&self) -> &str {
        "LightSpots"
    }

    fn osc_path(&self) -> &str {
        "/blobserver/lightSpots"
    }

    fn required_source_count(&self) -> usize {
        1
    }

    fn detect(&mut self, frames: &[Frame]) -> BlobReport {
        let Some(frame) = frames.first() else {
            return BlobReport::empty();
        };
        let mut working = frame.to_image();
        self.base.apply_mask(&mut working);

        let level = self.detection_level.clamp(0, 255) as u8;
        let binary: Vec<bool> = working.pixels().map(|p| luminance(p) >= level).collect();
        let min_area = (self.filter_size.max(1) * self.filter_size.max(1)) as usize;
        let components = extract_components(&binary, &working, min_area);
        debug!(spots = components.len(), "Light spot pass");

        let measures: Vec<_> = components.iter().map(|c| c.to_measurement()).collect();
        self.tracker.update(&measures);

        for blob in self.tracker.blobs() {
            let p = blob.properties();
            draw_cross(&mut working, p.x, p.y, Rgb([255, 0, 0]));
        }
        self.base.output = working;

        self.report_from_tracker()
    }

    fn set_mask(&mut self, mask: GrayImage) {
        self.base.set_mask(mask);
    }

    fn output_image(&self) -> RgbImage {
        self.base.output.clone()
    }

    fn add_source(&mut self, handle: SourceHandle) {
        self.base.sources.push(handle);
    }

    fn get_parameter(&self, name: &str) -> Result<Value, VisionError> {
        match name {
            "detectionLevel" => Ok(Value::Int(self.detection_level)),
            "filterSize" => Ok(Value::Int(self.filter_size)),
            "lifetime" => Ok(Value::Int(self.tracker.lifetime)),
            "processNoise" => Ok(Value::Float(self.tracker.process_noise)),
            "measurementNoise" => Ok(Value::Float(self.tracker.measurement_noise)),
            _ => Err(VisionError::Parameter(format!("Unknown parameter {}", name))),
        }
    }

    fn set_parameter(&mut self, name: &str, value: Value) -> Result<(), VisionError> {
        SCHEMA
            .check(name, &value)
            .map_err(|e| VisionError::Parameter(e.to_string()))?;
        match name {
            "detectionLevel" => self.detection_level = value.as_i32().unwrap_or(200).clamp(0, 255),
            "filterSize" => self.filter_size = value.as_i32().unwrap_or(3).max(1),
            "lifetime" => self.tracker.lifetime = value.as_i32().unwrap_or(DEFAULT_LIFETIME).max(0),
            "processNoise" => self.tracker.process_noise = value.as_f32().unwrap_or(0.1).max(0.0),
            "measurementNoise" => {
                self.tracker.measurement_noise = value.as_f32().unwrap_or(4.0).max(0.0)
            }
            _ => unreachable!("schema checked"),
        }
        Ok(())
    }
}
