//! Shared-memory reading source
//!
//! Reads frames from a segment written in the server's own output
//! layout, so one blobserver instance can feed another (or any writer
//! producing the same layout).

use crate::error::VisionError;
use crate::source::{CorrectionMatrix, Source};
use blobserver_core::shm::ShmReader;
use blobserver_core::{Frame, Value, SHM_PREFIX};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Source backed by an output segment. The subsource index selects the
/// segment (`<dir>/<prefix>_<subsource>`).
pub struct ShmSource {
    subsource: i32,
    dir: PathBuf,
    reader: Option<ShmReader>,
    frame: Option<Frame>,
    width: u32,
    height: u32,
    framerate: i32,
    correction: CorrectionMatrix,
    verbose: bool,
}

impl ShmSource {
    pub fn new(subsource: i32) -> Self {
        Self::with_dir(subsource, PathBuf::from("/tmp"))
    }

    pub fn with_dir(subsource: i32, dir: PathBuf) -> Self {
        Self {
            subsource,
            dir,
            reader: None,
            frame: None,
            width: 640,
            height: 480,
            framerate: 0,
            correction: CorrectionMatrix::default(),
            verbose: false,
        }
    }

    fn segment_path(&self) -> PathBuf {
        self.dir.join(format!("{}_{}", SHM_PREFIX, self.subsource))
    }
}

impl Source for ShmSource {
    fn kind(&self) -> &str {
        "Shm"
    }

    fn subsource(&self) -> i32 {
        self.subsource
    }

    fn connect(&mut self) -> bool {
        if self.reader.is_some() {
            return true;
        }
        match ShmReader::open(&self.segment_path()) {
            Ok(reader) => {
                self.reader = Some(reader);
                true
            }
            Err(e) => {
                debug!("Cannot attach segment: {}", e);
                false
            }
        }
    }

    fn grab(&mut self) {
        let Some(reader) = &mut self.reader else {
            return;
        };
        match reader.read() {
            Ok(Some((image, frame_nbr))) => {
                if self.verbose {
                    debug!(subsource = self.subsource, frame_nbr, "Segment frame");
                }
                self.width = image.width();
                self.height = image.height();
                self.frame = Some(Frame::new(image));
            }
            // No new frame published: keep the previous buffer.
            Ok(None) => {}
            Err(e) => warn!("Segment read failed, keeping previous frame: {}", e),
        }
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
            // Dimensions follow the writer; only the declared size of
            // the empty frame is adjustable.
            "width" => self.width = (number as u32).max(1),
            "height" => self.height = (number as u32).max(1),
            "framerate" => self.framerate = (number as i32).max(0),
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

    /// Segments present in the directory, by trailing index.
    fn subsources(&self) -> Vec<i32> {
        let prefix = format!("{}_", SHM_PREFIX);
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut indices: Vec<i32> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                name.strip_prefix(&prefix)?.parse().ok()
            })
            .collect();
        indices.sort_unstable();
        indices
    }
}
