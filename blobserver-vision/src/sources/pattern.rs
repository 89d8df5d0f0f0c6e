//! Synthetic test-pattern source

use crate::error::VisionError;
use crate::source::{CorrectionMatrix, Source};
use blobserver_core::{Frame, Value};
use image::{Rgb, RgbImage};
use tracing::debug;

const SUBSOURCE_COUNT: i32 = 4;
const SPOT_COUNT: usize = 3;
const SPOT_RADIUS: i32 = 6;

/// Deterministic source: bright spots orbiting the frame center on a
/// dark background, advancing one step per grab. Subsources differ by
/// phase, so two pattern inputs never look identical.
pub struct PatternSource {
    subsource: i32,
    width: u32,
    height: u32,
    framerate: i32,
    connected: bool,
    tick: u64,
    frame: Option<Frame>,
    correction: CorrectionMatrix,
    verbose: bool,
}

impl PatternSource {
    pub fn new(subsource: i32) -> Self {
        Self {
            subsource,
            width: 320,
            height: 240,
            framerate: 30,
            connected: false,
            tick: 0,
            frame: None,
            correction: CorrectionMatrix::default(),
            verbose: false,
        }
    }

    fn render(&self) -> RgbImage {
        let mut image = RgbImage::new(self.width, self.height);
        let (cx, cy) = (self.width as f32 / 2.0, self.height as f32 / 2.0);
        let orbit = (self.width.min(self.height) as f32) / 3.0;
        let phase = self.tick as f32 * 0.05 + self.subsource as f32;

        for spot in 0..SPOT_COUNT {
            let angle = phase + spot as f32 * std::f32::consts::TAU / SPOT_COUNT as f32;
            let sx = (cx + orbit * angle.cos()) as i32;
            let sy = (cy + orbit * angle.sin()) as i32;
            for dy in -SPOT_RADIUS..=SPOT_RADIUS {
                for dx in -SPOT_RADIUS..=SPOT_RADIUS {
                    if dx * dx + dy * dy > SPOT_RADIUS * SPOT_RADIUS {
                        continue;
                    }
                    let (px, py) = (sx + dx, sy + dy);
                    if px >= 0 && py >= 0 && (px as u32) < self.width && (py as u32) < self.height {
                        image.put_pixel(px as u32, py as u32, Rgb([255, 255, 230]));
                    }
                }
            }
        }
        image
    }
}

impl Source for PatternSource {
    fn kind(&self) -> &str {
        "Pattern"
    }

    fn subsource(&self) -> i32 {
        self.subsource
    }

    fn connect(&mut self) -> bool {
        if self.connected {
            return true;
        }
        if !(0..SUBSOURCE_COUNT).contains(&self.subsource) {
            debug!(subsource = self.subsource, "No such pattern subsource");
            return false;
        }
        self.connected = true;
        true
    }

    fn grab(&mut self) {
        if !self.connected {
            return;
        }
        self.tick += 1;
        if self.verbose {
            debug!(subsource = self.subsource, tick = self.tick, "Pattern frame");
        }
        self.frame = Some(Frame::new(self.render()));
    }

    fn retrieve_corrected(&self) -> Frame {
        match &self.frame {
            Some(frame) => {
                if self.correction.is_identity() {
                    frame.clone()
                } else {
                    Frame::new(self.correction.apply(frame.image()))
                }
            }
            None => Frame::empty(self.width, self.height),
        }
    }

    fn get_parameter(&self, name: &str) -> Result<Value, VisionError> {
        match name {
            "id" => Ok(Value::Int(self.subsource)),
            "width" => Ok(Value::Int(self.width as i32)),
            "height" => Ok(Value::Int(self.height as i32)),
            "framerate" => Ok(Value::Int(self.framerate)),
            "verbose" => Ok(Value::Bool(self.verbose)),
            _ => match self.correction.get(name) {
                Some(value) => Ok(Value::Float(value)),
                None => Err(VisionError::Parameter(format!("Unknown parameter {}", name))),
            },
        }
    }

    fn set_parameter(&mut self, name: &str, value: Value) -> Result<(), VisionError> {
        if name == "verbose" {
            self.verbose = value
                .as_bool()
                .ok_or_else(|| VisionError::Parameter("Parameter verbose expects a flag".to_string()))?;
            return Ok(());
        }
        let number = value
            .as_f32()
            .ok_or_else(|| VisionError::Parameter(format!("Parameter {} expects a number", name)))?;
        match name {
            "width" => self.width = (number as u32).max(1),
            "height" => self.height = (number as u32).max(1),
            "framerate" => self.framerate = (number as i32).max(1),
            "id" => {
                return Err(VisionError::Parameter("Parameter id is read-only".to_string()));
            }
            _ => {
                if !self.correction.set(name, number) {
                    return Err(VisionError::Parameter(format!("Unknown parameter {}", name)));
                }
            }
        }
        Ok(())
    }

    fn subsources(&self) -> Vec<i32> {
        (0..SUBSOURCE_COUNT).collect()
    }
}
