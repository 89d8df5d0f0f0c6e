//! Connected-component extraction shared by the pixel detectors

use crate::tracker::BlobProperties;
use image::{Rgb, RgbImage};

pub(crate) fn luminance(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32) as u8
}

/// One connected region of set pixels.
#[derive(Debug, Clone)]
pub(crate) struct Component {
    pub area: usize,
    pub cx: f32,
    pub cy: f32,
    pub color: [u8; 3],
    /// Principal-axis angle from the second central moments, radians.
    pub orientation: f32,
}

impl Component {
    pub fn to_measurement(&self) -> BlobProperties {
        BlobProperties {
            x: self.cx.round() as i32,
            y: self.cy.round() as i32,
            vx: 0.0,
            vy: 0.0,
            color: self.color,
            orientation: self.orientation,
            size: self.area as f32,
        }
    }
}

/// 4-connected component labelling over a binary map. Components
/// smaller than `min_area` pixels are noise and dropped.
pub(crate) fn extract_components(
    binary: &[bool],
    image: &RgbImage,
    min_area: usize,
) -> Vec<Component> {
    let (width, height) = image.dimensions();
    let (width, height) = (width as usize, height as usize);
    debug_assert_eq!(binary.len(), width * height);

    let mut visited = vec![false; binary.len()];
    let mut components = Vec::new();
    let mut stack = Vec::new();

    for start in 0..binary.len() {
        if !binary[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);

        let mut area = 0usize;
        let (mut sx, mut sy) = (0.0f64, 0.0f64);
        let (mut sxx, mut syy, mut sxy) = (0.0f64, 0.0f64, 0.0f64);
        let (mut sr, mut sg, mut sb) = (0u64, 0u64, 0u64);

        while let Some(idx) = stack.pop() {
            let x = idx % width;
            let y = idx / width;
            area += 1;
            let (xf, yf) = (x as f64, y as f64);
            sx += xf;
            sy += yf;
            sxx += xf * xf;
            syy += yf * yf;
            sxy += xf * yf;
            let [r, g, b] = image.get_pixel(x as u32, y as u32).0;
            sr += r as u64;
            sg += g as u64;
            sb += b as u64;

            let mut visit = |nx: usize, ny: usize| {
                let nidx = ny * width + nx;
                if binary[nidx] && !visited[nidx] {
                    visited[nidx] = true;
                    stack.push(nidx);
                }
            };
            if x > 0 {
                visit(x - 1, y);
            }
            if x + 1 < width {
                visit(x + 1, y);
            }
            if y > 0 {
                visit(x, y - 1);
            }
            if y + 1 < height {
                visit(x, y + 1);
            }
        }

        if area < min_area {
            continue;
        }

        let n = area as f64;
        let cx = sx / n;
        let cy = sy / n;
        let mu20 = sxx / n - cx * cx;
        let mu02 = syy / n - cy * cy;
        let mu11 = sxy / n - cx * cy;
        let orientation = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);

        components.push(Component {
            area,
            cx: cx as f32,
            cy: cy as f32,
            color: [
                (sr / area as u64) as u8,
                (sg / area as u64) as u8,
                (sb / area as u64) as u8,
            ],
            orientation: orientation as f32,
        });
    }

    components
}

/// Mark a blob position on a visualization buffer with a small cross.
pub(crate) fn draw_cross(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    for d in -3i32..=3 {
        for (px, py) in [(x + d, y), (x, y + d)] {
            if px >= 0 && py >= 0 && (px as u32) < width && (py as u32) < height {
                image.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_from(image: &RgbImage, level: u8) -> Vec<bool> {
        image.pixels().map(|p| luminance(p) >= level).collect()
    }

    fn square(image: &mut RgbImage, x0: u32, y0: u32, side: u32, color: Rgb<u8>) {
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                image.put_pixel(x, y, color);
            }
        }
    }

    #[test]
    fn test_two_squares_two_components() {
        let mut image = RgbImage::new(32, 32);
        square(&mut image, 2, 2, 4, Rgb([255, 255, 255]));
        square(&mut image, 20, 20, 4, Rgb([255, 255, 255]));

        let binary = binary_from(&image, 200);
        let components = extract_components(&binary, &image, 4);
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].area, 16);
        // Centroid of a square spanning 2..=5 is 3.5.
        assert!((components[0].cx - 3.5).abs() < 1e-3);
        assert!((components[0].cy - 3.5).abs() < 1e-3);
        assert_eq!(components[0].color, [255, 255, 255]);
    }

    #[test]
    fn test_min_area_filters_noise() {
        let mut image = RgbImage::new(16, 16);
        image.put_pixel(8, 8, Rgb([255, 255, 255]));
        let binary = binary_from(&image, 200);
        assert!(extract_components(&binary, &image, 4).is_empty());
        assert_eq!(extract_components(&binary, &image, 1).len(), 1);
    }

    #[test]
    fn test_diagonal_pixels_are_separate() {
        let mut image = RgbImage::new(8, 8);
        image.put_pixel(1, 1, Rgb([255, 255, 255]));
        image.put_pixel(2, 2, Rgb([255, 255, 255]));
        let binary = binary_from(&image, 200);
        assert_eq!(extract_components(&binary, &image, 1).len(), 2);
    }

    #[test]
    fn test_orientation_follows_elongation() {
        let mut image = RgbImage::new(32, 32);
        // A 12x2 horizontal bar.
        for x in 4..16 {
            for y in 10..12 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let binary = binary_from(&image, 200);
        let components = extract_components(&binary, &image, 4);
        assert_eq!(components.len(), 1);
        assert!(components[0].orientation.abs() < 0.1);
    }
}
