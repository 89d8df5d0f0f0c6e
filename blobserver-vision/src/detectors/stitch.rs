//! Two-source image composition

use crate::detector::{BlobReport, Detector, DetectorBase};
use crate::error::VisionError;
use crate::source::SourceHandle;
use blobserver_core::{Frame, ParamSchema, Value, ValueKind};
use image::{GrayImage, RgbImage};

const SOURCE_COUNT: usize = 2;

const SCHEMA: ParamSchema = ParamSchema::new(&[
    ("pos0x", ValueKind::Int),
    ("pos0y", ValueKind::Int),
    ("pos1x", ValueKind::Int),
    ("pos1y", ValueKind::Int),
    ("crop0x", ValueKind::Int),
    ("crop0y", ValueKind::Int),
    ("crop0w", ValueKind::Int),
    ("crop0h", ValueKind::Int),
    ("crop1x", ValueKind::Int),
    ("crop1y", ValueKind::Int),
    ("crop1w", ValueKind::Int),
    ("crop1h", ValueKind::Int),
]);

#[derive(Debug, Clone, Copy, Default)]
struct Placement {
    x: i32,
    y: i32,
    crop_x: u32,
    crop_y: u32,
    /// 0 means the full remaining width/height.
    crop_w: u32,
    crop_h: u32,
}

/// Pastes two synchronized inputs into one output buffer, each at a
/// configurable position with an optional crop. The composite goes to
/// the flow's output segment; there are no blobs to report.
pub struct StitchDetector {
    base: DetectorBase,
    placements: [Placement; SOURCE_COUNT],
    /// Side-by-side by default until `pos1x` is set.
    auto_layout: bool,
}

impl Default for StitchDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl StitchDetector {
    pub fn new() -> Self {
        Self {
            base: DetectorBase::new(),
            placements: [Placement::default(); SOURCE_COUNT],
            auto_layout: true,
        }
    }

    fn cropped_region(frame: &RgbImage, placement: &Placement) -> (u32, u32, u32, u32) {
        let (width, height) = frame.dimensions();
        let x0 = placement.crop_x.min(width);
        let y0 = placement.crop_y.min(height);
        let w = if placement.crop_w == 0 {
            width - x0
        } else {
            placement.crop_w.min(width - x0)
        };
        let h = if placement.crop_h == 0 {
            height - y0
        } else {
            placement.crop_h.min(height - y0)
        };
        (x0, y0, w, h)
    }

    fn param_mut(&mut self, name: &str) -> Option<&mut i32> {
        // Positions only; crops go through param_crop_mut.
        match name {
            "pos0x" => Some(&mut self.placements[0].x),
            "pos0y" => Some(&mut self.placements[0].y),
            "pos1x" => Some(&mut self.placements[1].x),
            "pos1y" => Some(&mut self.placements[1].y),
            _ => None,
        }
    }

    fn crop_mut(&mut self, name: &str) -> Option<&mut u32> {
        match name {
            "crop0x" => Some(&mut self.placements[0].crop_x),
            "crop0y" => Some(&mut self.placements[0].crop_y),
            "crop0w" => Some(&mut self.placements[0].crop_w),
            "crop0h" => Some(&mut self.placements[0].crop_h),
            "crop1x" => Some(&mut self.placements[1].crop_x),
            "crop1y" => Some(&mut self.placements[1].crop_y),
            "crop1w" => Some(&mut self.placements[1].crop_w),
            "crop1h" => Some(&mut self.placements[1].crop_h),
            _ => None,
        }
    }
}

impl Detector for StitchDetector {
    fn kind(&self) -> &str {
        "Stitch"
    }

    fn osc_path(&self) -> &str {
        "/blobserver/stitch"
    }

    fn required_source_count(&self) -> usize {
        SOURCE_COUNT
    }

    fn detect(&mut self, frames: &[Frame]) -> BlobReport {
        if frames.is_empty() {
            return BlobReport::empty();
        }
        if self.auto_layout {
            // First input's width decides where the second one lands.
            self.placements[1].x = frames[0].width() as i32;
            self.placements[1].y = 0;
        }

        let mut regions = Vec::with_capacity(frames.len());
        let (mut out_w, mut out_h) = (1u32, 1u32);
        for (frame, placement) in frames.iter().zip(self.placements.iter()).take(SOURCE_COUNT) {
            let region = Self::cropped_region(frame.image(), placement);
            let right = (placement.x.max(0) as u32).saturating_add(region.2);
            let bottom = (placement.y.max(0) as u32).saturating_add(region.3);
            out_w = out_w.max(right);
            out_h = out_h.max(bottom);
            regions.push(region);
        }

        let mut output = RgbImage::new(out_w, out_h);
        for ((frame, placement), (x0, y0, w, h)) in frames
            .iter()
            .zip(self.placements.iter())
            .zip(regions)
            .take(SOURCE_COUNT)
        {
            let image = frame.image();
            for dy in 0..h {
                for dx in 0..w {
                    let ox = placement.x + dx as i32;
                    let oy = placement.y + dy as i32;
                    if ox < 0 || oy < 0 {
                        continue;
                    }
                    let (ox, oy) = (ox as u32, oy as u32);
                    if ox < out_w && oy < out_h {
                        output.put_pixel(ox, oy, *image.get_pixel(x0 + dx, y0 + dy));
                    }
                }
            }
        }
        let mut masked = output;
        self.base.apply_mask(&mut masked);
        self.base.output = masked;

        BlobReport::empty()
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
        if let Some(value) = match name {
            "pos0x" => Some(self.placements[0].x),
            "pos0y" => Some(self.placements[0].y),
            "pos1x" => Some(self.placements[1].x),
            "pos1y" => Some(self.placements[1].y),
            "crop0x" => Some(self.placements[0].crop_x as i32),
            "crop0y" => Some(self.placements[0].crop_y as i32),
            "crop0w" => Some(self.placements[0].crop_w as i32),
            "crop0h" => Some(self.placements[0].crop_h as i32),
            "crop1x" => Some(self.placements[1].crop_x as i32),
            "crop1y" => Some(self.placements[1].crop_y as i32),
            "crop1w" => Some(self.placements[1].crop_w as i32),
            "crop1h" => Some(self.placements[1].crop_h as i32),
            _ => None,
        } {
            Ok(Value::Int(value))
        } else {
            Err(VisionError::Parameter(format!("Unknown parameter {}", name)))
        }
    }

    fn set_parameter(&mut self, name: &str, value: Value) -> Result<(), VisionError> {
        SCHEMA
            .check(name, &value)
            .map_err(|e| VisionError::Parameter(e.to_string()))?;
        let raw = value.as_i32().unwrap_or(0);
        if name == "pos1x" || name == "pos1y" {
            self.auto_layout = false;
        }
        if let Some(slot) = self.param_mut(name) {
            *slot = raw;
        } else if let Some(slot) = self.crop_mut(name) {
            *slot = raw.max(0) as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid_frame(width: u32, height: u32, color: [u8; 3]) -> Frame {
        Frame::new(RgbImage::from_pixel(width, height, Rgb(color)))
    }

    #[test]
    fn test_side_by_side_by_default() {
        let mut detector = StitchDetector::new();
        let report = detector.detect(&[
            solid_frame(8, 4, [255, 0, 0]),
            solid_frame(8, 4, [0, 255, 0]),
        ]);
        assert!(report.is_empty());

        let output = detector.output_image();
        assert_eq!(output.dimensions(), (16, 4));
        assert_eq!(output.get_pixel(2, 2).0, [255, 0, 0]);
        assert_eq!(output.get_pixel(10, 2).0, [0, 255, 0]);
    }

    #[test]
    fn test_explicit_placement() {
        let mut detector = StitchDetector::new();
        detector.set_parameter("pos1x", Value::Int(0)).unwrap();
        detector.set_parameter("pos1y", Value::Int(4)).unwrap();
        detector.detect(&[
            solid_frame(8, 4, [255, 0, 0]),
            solid_frame(8, 4, [0, 255, 0]),
        ]);

        let output = detector.output_image();
        assert_eq!(output.dimensions(), (8, 8));
        assert_eq!(output.get_pixel(2, 6).0, [0, 255, 0]);
    }

    #[test]
    fn test_crop_limits_pasted_region() {
        let mut detector = StitchDetector::new();
        detector.set_parameter("crop1w", Value::Int(2)).unwrap();
        detector.detect(&[
            solid_frame(8, 4, [255, 0, 0]),
            solid_frame(8, 4, [0, 255, 0]),
        ]);

        let output = detector.output_image();
        assert_eq!(output.dimensions(), (10, 4));
        assert_eq!(output.get_pixel(9, 2).0, [0, 255, 0]);
    }

    #[test]
    fn test_requires_two_sources() {
        let detector = StitchDetector::new();
        assert_eq!(detector.required_source_count(), 2);
    }
}
