//! Luminance outlier extraction

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
    ("detectionLevel", ValueKind::Float),
    ("filterSize", ValueKind::Int),
    ("lifetime", ValueKind::Int),
]);

/// Flags pixels whose luminance deviates from the frame mean by more
/// than `detectionLevel` standard deviations, groups them into
/// components and tracks the result. Works without any background
/// model, which suits scenes with a mostly uniform backdrop.
///
/// Per-blob fields: `x y vx vy id`, all integers.
pub struct MeanOutliersDetector {
    base: DetectorBase,
    tracker: BlobTracker,
    detection_level: f32,
    filter_size: i32,
}

impl Default for MeanOutliersDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl MeanOutliersDetector {
    pub fn new() -> Self {
        Self {
            base: DetectorBase::new(),
            tracker: BlobTracker::new(DEFAULT_LIFETIME),
            detection_level: 2.0,
            filter_size: 3,
        }
    }
}

impl Detector for MeanOutliersDetector {
    fn kind(&self) -> &str {
        "MeanOutliers"
    }

    fn osc_path(&self) -> &str {
        "/blobserver/meanOutliers"
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

        let pixel_count = (working.width() * working.height()) as f64;
        if pixel_count == 0.0 {
            return BlobReport::empty();
        }
        let lums: Vec<u8> = working.pixels().map(luminance).collect();
        let mean = lums.iter().map(|&l| l as f64).sum::<f64>() / pixel_count;
        let variance = lums
            .iter()
            .map(|&l| {
                let d = l as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / pixel_count;
        let stddev = variance.sqrt();

        let threshold = self.detection_level as f64 * stddev;
        let binary: Vec<bool> = lums
            .iter()
            .map(|&l| (l as f64 - mean).abs() > threshold && stddev > 0.0)
            .collect();
        let min_area = (self.filter_size.max(1) * self.filter_size.max(1)) as usize;
        let components = extract_components(&binary, &working, min_area);
        debug!(mean, stddev, outliers = components.len(), "Outlier pass");

        let measures: Vec<_> = components.iter().map(|c| c.to_measurement()).collect();
        self.tracker.update(&measures);

        // Visualization: outlier pixels lit, tracked centers marked.
        let mut output = RgbImage::new(working.width(), working.height());
        for (idx, &set) in binary.iter().enumerate() {
            if set {
                let x = idx as u32 % working.width();
                let y = idx as u32 / working.width();
                output.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        for blob in self.tracker.blobs() {
            let p = blob.properties();
            draw_cross(&mut output, p.x, p.y, Rgb([255, 0, 0]));
        }
        self.base.output = output;

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
            "detectionLevel" => Ok(Value::Float(self.detection_level)),
            "filterSize" => Ok(Value::Int(self.filter_size)),
            "lifetime" => Ok(Value::Int(self.tracker.lifetime)),
            _ => Err(VisionError::Parameter(format!("Unknown parameter {}", name))),
        }
    }

    fn set_parameter(&mut self, name: &str, value: Value) -> Result<(), VisionError> {
        SCHEMA
            .check(name, &value)
            .map_err(|e| VisionError::Parameter(e.to_string()))?;
        match name {
            "detectionLevel" => self.detection_level = value.as_f32().unwrap_or(2.0).max(0.0),
            "filterSize" => self.filter_size = value.as_i32().unwrap_or(3).max(1),
            "lifetime" => self.tracker.lifetime = value.as_i32().unwrap_or(DEFAULT_LIFETIME).max(0),
            _ => unreachable!("schema checked"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_frame_has_no_outliers() {
        let mut detector = MeanOutliersDetector::new();
        let frame = Frame::new(RgbImage::from_pixel(32, 32, Rgb([80, 80, 80])));
        assert!(detector.detect(&[frame]).is_empty());
    }

    #[test]
    fn test_bright_patch_is_an_outlier() {
        let mut detector = MeanOutliersDetector::new();
        let mut image = RgbImage::from_pixel(64, 64, Rgb([40, 40, 40]));
        for y in 20..26 {
            for x in 20..26 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let report = detector.detect(&[Frame::new(image)]);
        assert_eq!(report.blob_count(), 1);
        // Patch spans 20..=25, centroid 22.5.
        let blob = report.blob(0);
        assert_eq!(blob[0], Value::Int(23));
        assert_eq!(blob[1], Value::Int(23));
    }

    #[test]
    fn test_empty_frame_tuple() {
        let mut detector = MeanOutliersDetector::new();
        assert!(detector.detect(&[]).is_empty());
    }
}
