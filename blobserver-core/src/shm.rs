//! Output image shared-memory segments
//!
//! Every flow publishes its detector's visualization to a file-backed
//! segment (`/tmp/blobserver_output_<flow_id>` by default). The layout
//! is a small fixed header followed by the raw pixels:
//!
//! ```text
//! offset  size  field
//! 0       4     magic ("BSHM", little endian)
//! 4       4     width
//! 8       4     height
//! 12      4     channels (3, RGB8)
//! 16      8     frame counter, bumped after the pixels are in place
//! 24      -     width * height * channels bytes
//! ```
//!
//! Dimensions are declared on the first write; a writer remaps the
//! segment if the output dimensions change.

use crate::error::{Error, Result};
use image::RgbImage;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

pub const SHM_MAGIC: u32 = 0x4253_484d;
const HEADER_LEN: usize = 24;
const CHANNELS: u32 = 3;

fn segment_len(width: u32, height: u32) -> usize {
    HEADER_LEN + (width * height * CHANNELS) as usize
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Writing side of a segment, owned by a flow.
pub struct ShmWriter {
    mmap: MmapMut,
    file: File,
    path: PathBuf,
    width: u32,
    height: u32,
    frame_nbr: u64,
}

impl ShmWriter {
    /// Create (or truncate) the segment at `path` with the declared
    /// dimensions.
    pub fn create(path: &Path, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Shm(format!(
                "Segment {} needs non-zero dimensions",
                path.display()
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::Shm(format!("Failed to open {}: {}", path.display(), e)))?;
        file.set_len(segment_len(width, height) as u64)
            .map_err(|e| Error::Shm(format!("Failed to size {}: {}", path.display(), e)))?;
        let mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .map_err(|e| Error::Shm(format!("Failed to map {}: {}", path.display(), e)))?
        };
        let mut writer = Self {
            mmap,
            file,
            path: path.to_path_buf(),
            width,
            height,
            frame_nbr: 0,
        };
        writer.write_header();
        Ok(writer)
    }

    fn write_header(&mut self) {
        self.mmap[0..4].copy_from_slice(&SHM_MAGIC.to_le_bytes());
        self.mmap[4..8].copy_from_slice(&self.width.to_le_bytes());
        self.mmap[8..12].copy_from_slice(&self.height.to_le_bytes());
        self.mmap[12..16].copy_from_slice(&CHANNELS.to_le_bytes());
        self.mmap[16..24].copy_from_slice(&self.frame_nbr.to_le_bytes());
    }

    /// Publish one frame. The segment is remapped when the image
    /// dimensions differ from the declared ones.
    pub fn write(&mut self, image: &RgbImage) -> Result<()> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(());
        }
        if width != self.width || height != self.height {
            self.file
                .set_len(segment_len(width, height) as u64)
                .map_err(|e| Error::Shm(format!("Failed to resize {}: {}", self.path.display(), e)))?;
            self.mmap = unsafe {
                MmapOptions::new()
                    .map_mut(&self.file)
                    .map_err(|e| Error::Shm(format!("Failed to remap {}: {}", self.path.display(), e)))?
            };
            self.width = width;
            self.height = height;
        }
        self.mmap[HEADER_LEN..].copy_from_slice(image.as_raw());
        // The counter is bumped after the pixels so readers polling it
        // never observe a half-written frame as new.
        self.frame_nbr += 1;
        self.write_header();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_nbr(&self) -> u64 {
        self.frame_nbr
    }
}

/// Reading side of a segment, used by the `Shm` source kind to chain
/// blobserver instances.
pub struct ShmReader {
    mmap: Mmap,
    file: File,
    path: PathBuf,
    last_frame: u64,
}

impl ShmReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Shm(format!("Failed to open {}: {}", path.display(), e)))?;
        let mmap = unsafe {
            MmapOptions::new()
                .map(&file)
                .map_err(|e| Error::Shm(format!("Failed to map {}: {}", path.display(), e)))?
        };
        if mmap.len() < HEADER_LEN || read_u32(&mmap, 0) != SHM_MAGIC {
            return Err(Error::Shm(format!(
                "{} is not a blobserver segment",
                path.display()
            )));
        }
        Ok(Self {
            mmap,
            file,
            path: path.to_path_buf(),
            last_frame: 0,
        })
    }

    /// Latest frame if one has been published since the previous call,
    /// `None` otherwise.
    pub fn read(&mut self) -> Result<Option<(RgbImage, u64)>> {
        let frame_nbr = read_u64(&self.mmap, 16);
        if frame_nbr == self.last_frame {
            return Ok(None);
        }
        let width = read_u32(&self.mmap, 4);
        let height = read_u32(&self.mmap, 8);
        let expected = segment_len(width, height);
        if self.mmap.len() < expected {
            // The writer grew the segment; follow it.
            self.mmap = unsafe {
                MmapOptions::new()
                    .map(&self.file)
                    .map_err(|e| Error::Shm(format!("Failed to remap {}: {}", self.path.display(), e)))?
            };
            if self.mmap.len() < expected {
                return Ok(None);
            }
        }
        let pixels = self.mmap[HEADER_LEN..expected].to_vec();
        let Some(image) = RgbImage::from_raw(width, height, pixels) else {
            return Ok(None);
        };
        self.last_frame = frame_nbr;
        Ok(Some((image, frame_nbr)))
    }
}

/// Remove leftover segments from previous runs. Returns how many files
/// went away.
pub fn remove_stale_segments(dir: &Path, prefix: &str) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(prefix) && entry.file_type()?.is_file() {
            std::fs::remove_file(entry.path())?;
            info!("Removed stale segment {}", entry.path().display());
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn test_image(width: u32, height: u32, seed: u8) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([seed, (x % 256) as u8, (y % 256) as u8])
        })
    }

    #[test]
    fn test_writer_reader_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobserver_output_1");
        let mut writer = ShmWriter::create(&path, 16, 8).unwrap();
        let mut reader = ShmReader::open(&path).unwrap();

        assert!(reader.read().unwrap().is_none());

        let image = test_image(16, 8, 7);
        writer.write(&image).unwrap();
        let (read_back, frame_nbr) = reader.read().unwrap().unwrap();
        assert_eq!(frame_nbr, 1);
        assert_eq!(read_back.as_raw(), image.as_raw());

        // Nothing new until the next write.
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn test_writer_redeclares_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobserver_output_2");
        let mut writer = ShmWriter::create(&path, 4, 4).unwrap();
        writer.write(&test_image(4, 4, 1)).unwrap();
        writer.write(&test_image(8, 6, 2)).unwrap();

        let mut reader = ShmReader::open(&path).unwrap();
        let (image, frame_nbr) = reader.read().unwrap().unwrap();
        assert_eq!(frame_nbr, 2);
        assert_eq!(image.dimensions(), (8, 6));
    }

    #[test]
    fn test_create_rejects_zero_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShmWriter::create(&dir.path().join("seg"), 0, 4).is_err());
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_segment");
        std::fs::write(&path, b"0123456789abcdef01234567").unwrap();
        assert!(ShmReader::open(&path).is_err());
    }

    #[test]
    fn test_remove_stale_segments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blobserver_output_3"), b"x").unwrap();
        std::fs::write(dir.path().join("unrelated"), b"x").unwrap();
        let removed = remove_stale_segments(dir.path(), "blobserver_output").unwrap();
        assert_eq!(removed, 1);
        assert!(dir.path().join("unrelated").exists());
    }
}
