//! Reference-counted video frames

use image::RgbImage;
use std::sync::Arc;

/// A video frame shared between the capture thread, the processing
/// loop and detectors.
///
/// Cloning a frame is cheap: the pixel buffer is reference counted and
/// read-only. Detectors copy the pixels only when they need a mutable
/// working buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    inner: Arc<RgbImage>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            inner: Arc::new(image),
        }
    }

    /// A black frame of the given dimensions.
    pub fn empty(width: u32, height: u32) -> Self {
        Self::new(RgbImage::new(width, height))
    }

    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.inner
    }

    /// Owned copy of the pixel buffer, for mutable working buffers.
    pub fn to_image(&self) -> RgbImage {
        (*self.inner).clone()
    }
}

impl From<RgbImage> for Frame {
    fn from(image: RgbImage) -> Self {
        Self::new(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_frame_dimensions() {
        let frame = Frame::empty(640, 480);
        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
    }

    #[test]
    fn test_empty_frame_is_black() {
        let frame = Frame::empty(8, 8);
        assert!(frame.image().pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_clone_shares_buffer() {
        let frame = Frame::empty(4, 4);
        let copy = frame.clone();
        assert!(std::ptr::eq(frame.image(), copy.image()));
    }
}
