//! Detector contract and shared facilities

use crate::error::VisionError;
use crate::source::SourceHandle;
use blobserver_core::{Frame, Value};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use rayon::prelude::*;

/// Flat per-frame blob report: `blob_count` blobs of `field_count`
/// values each, laid out blob-major in `values`. The field layout is
/// fixed per detector kind.
#[derive(Debug, Clone, Default)]
pub struct BlobReport {
    blob_count: usize,
    field_count: usize,
    values: Vec<Value>,
}

impl BlobReport {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append one blob. All blobs in a report carry the same number of
    /// fields; a mismatched row is dropped.
    pub fn push_blob(&mut self, fields: Vec<Value>) {
        if self.blob_count == 0 {
            self.field_count = fields.len();
        } else if fields.len() != self.field_count {
            return;
        }
        self.values.extend(fields);
        self.blob_count += 1;
    }

    pub fn blob_count(&self) -> usize {
        self.blob_count
    }

    pub fn field_count(&self) -> usize {
        self.field_count
    }

    pub fn blob(&self, index: usize) -> &[Value] {
        let start = index * self.field_count;
        &self.values[start..start + self.field_count]
    }

    pub fn is_empty(&self) -> bool {
        self.blob_count == 0
    }
}

/// Capability set every detector implements. A detector instance is
/// owned by exactly one flow and never invoked concurrently.
pub trait Detector: Send {
    /// Kind name, as registered with the detector factory.
    fn kind(&self) -> &str;

    /// Path the per-blob messages are emitted on.
    fn osc_path(&self) -> &str;

    /// Number of synchronized input frames per `detect` call.
    fn required_source_count(&self) -> usize;

    /// Run detection over one frame tuple. `frames.len()` equals
    /// `required_source_count`. Detection failure yields an empty
    /// report; the flow keeps running.
    fn detect(&mut self, frames: &[Frame]) -> BlobReport;

    /// Bind a mask; subsequent detections zero-mask their working
    /// frames.
    fn set_mask(&mut self, mask: GrayImage);

    /// Visualization of the last `detect` call, same dimensions as the
    /// primary input.
    fn output_image(&self) -> RgbImage;

    /// Non-owning source reference handed over at flow creation, for
    /// closed-loop control.
    fn add_source(&mut self, handle: SourceHandle);

    fn get_parameter(&self, name: &str) -> Result<Value, VisionError>;

    fn set_parameter(&mut self, name: &str, value: Value) -> Result<(), VisionError>;
}

/// State the in-tree detectors share: the output buffer, the bound
/// mask and its resized cache, and the source back-references.
pub struct DetectorBase {
    pub output: RgbImage,
    pub sources: Vec<SourceHandle>,
    mask: Option<GrayImage>,
    resized_mask: Option<GrayImage>,
}

impl Default for DetectorBase {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBase {
    pub fn new() -> Self {
        Self {
            output: RgbImage::new(0, 0),
            sources: Vec::new(),
            mask: None,
            resized_mask: None,
        }
    }

    pub fn set_mask(&mut self, mask: GrayImage) {
        self.resized_mask = None;
        self.mask = Some(mask);
    }

    pub fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    /// Zero every pixel of `buffer` whose mask pixel is zero.
    ///
    /// The mask is resized to the buffer dimensions (nearest
    /// neighbour) and cached until the dimensions change. Rows are
    /// processed in parallel; each flow masks its own buffer, so this
    /// is safe to run while other flows process theirs.
    pub fn apply_mask(&mut self, buffer: &mut RgbImage) {
        let Some(mask) = &self.mask else {
            return;
        };
        let (width, height) = buffer.dimensions();
        if width == 0 || height == 0 {
            return;
        }
        let needs_resize = self
            .resized_mask
            .as_ref()
            .map_or(true, |m| m.dimensions() != (width, height));
        if needs_resize {
            self.resized_mask = Some(imageops::resize(mask, width, height, FilterType::Nearest));
        }
        let Some(mask) = self.resized_mask.as_ref() else {
            return;
        };

        let width = width as usize;
        let data: &mut [u8] = buffer;
        let mask_data: &[u8] = mask;
        data.par_chunks_mut(width * 3)
            .zip(mask_data.par_chunks(width))
            .for_each(|(row, mask_row)| {
                for x in 0..width {
                    if mask_row[x] == 0 {
                        row[x * 3..x * 3 + 3].fill(0);
                    }
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    #[test]
    fn test_blob_report_layout() {
        let mut report = BlobReport::empty();
        assert!(report.is_empty());
        report.push_blob(vec![Value::Int(10), Value::Int(20)]);
        report.push_blob(vec![Value::Int(30), Value::Int(40)]);
        assert_eq!(report.blob_count(), 2);
        assert_eq!(report.field_count(), 2);
        assert_eq!(report.blob(1), &[Value::Int(30), Value::Int(40)]);
    }

    #[test]
    fn test_blob_report_drops_mismatched_row() {
        let mut report = BlobReport::empty();
        report.push_blob(vec![Value::Int(1), Value::Int(2)]);
        report.push_blob(vec![Value::Int(3)]);
        assert_eq!(report.blob_count(), 1);
    }

    #[test]
    fn test_mask_zeroes_masked_pixels() {
        let mut base = DetectorBase::new();
        let mut mask = GrayImage::from_pixel(4, 4, Luma([255]));
        mask.put_pixel(1, 1, Luma([0]));
        base.set_mask(mask);

        let mut buffer = RgbImage::from_pixel(4, 4, Rgb([50, 60, 70]));
        base.apply_mask(&mut buffer);
        assert_eq!(buffer.get_pixel(1, 1).0, [0, 0, 0]);
        assert_eq!(buffer.get_pixel(0, 0).0, [50, 60, 70]);
    }

    #[test]
    fn test_mask_resized_to_buffer() {
        let mut base = DetectorBase::new();
        // 2x2 mask with the right half masked out, applied to an 8x8
        // buffer.
        let mask = GrayImage::from_fn(2, 2, |x, _| if x == 0 { Luma([255]) } else { Luma([0]) });
        base.set_mask(mask);

        let mut buffer = RgbImage::from_pixel(8, 8, Rgb([10, 10, 10]));
        base.apply_mask(&mut buffer);
        assert_eq!(buffer.get_pixel(0, 4).0, [10, 10, 10]);
        assert_eq!(buffer.get_pixel(7, 4).0, [0, 0, 0]);
    }

    #[test]
    fn test_no_mask_is_noop() {
        let mut base = DetectorBase::new();
        let mut buffer = RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]));
        base.apply_mask(&mut buffer);
        assert_eq!(buffer.get_pixel(1, 1).0, [1, 2, 3]);
    }
}
