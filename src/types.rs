use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{CutoutError, Result};

/// Raw RGBA pixel buffer, 4 bytes per pixel, row-major, no padding.
///
/// The buffer length is checked against the dimensions when the value is
/// built, so every `Image` in the pipeline is well formed. Moving an `Image`
/// into a worker request moves the allocation; nothing is copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(4));
        if width == 0 || height == 0 || expected != Some(pixels.len()) {
            return Err(CutoutError::InvalidImage {
                width,
                height,
                len: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Image filled with a single RGBA colour.
    pub fn from_pixel(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self> {
        let len = (width as usize) * (height as usize);
        Self::new(width, height, rgba.repeat(len))
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }

    pub const fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }

    /// Alpha channel only, row-major.
    pub fn alpha(&self) -> Vec<u8> {
        self.pixels.chunks_exact(4).map(|p| p[3]).collect()
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.pixels
    }
}

/// Which execution path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendTag {
    HardwareAccelerated,
    VectorizedCpu,
    BaselineCpu,
    Heuristic,
}

impl BackendTag {
    /// Model backends in the order they are attempted.
    pub const PRIORITY: [BackendTag; 3] = [
        BackendTag::HardwareAccelerated,
        BackendTag::VectorizedCpu,
        BackendTag::BaselineCpu,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            BackendTag::HardwareAccelerated => "hardware-accelerated",
            BackendTag::VectorizedCpu => "vectorized-cpu",
            BackendTag::BaselineCpu => "baseline-cpu",
            BackendTag::Heuristic => "heuristic",
        }
    }
}

impl fmt::Display for BackendTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Downloading,
    Loading,
    Ready,
    Error,
}

impl Stage {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Stage::Ready | Stage::Error)
    }
}

/// One notification in the stream emitted while a session is being built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub progress: Option<f32>,
    pub error_message: Option<String>,
}

impl ProgressEvent {
    pub const fn downloading(progress: Option<f32>) -> Self {
        Self {
            stage: Stage::Downloading,
            progress,
            error_message: None,
        }
    }

    pub const fn loading() -> Self {
        Self {
            stage: Stage::Loading,
            progress: None,
            error_message: None,
        }
    }

    pub const fn ready() -> Self {
        Self {
            stage: Stage::Ready,
            progress: Some(1.0),
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            stage: Stage::Error,
            progress: None,
            error_message: Some(message.into()),
        }
    }
}

/// Immutable model blob identified by its logical cache key.
///
/// Clones share the same allocation.
#[derive(Clone, PartialEq, Eq)]
pub struct ModelBytes {
    key: String,
    bytes: Arc<[u8]>,
}

impl ModelBytes {
    pub fn new(key: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            bytes: bytes.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for ModelBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBytes")
            .field("key", &self.key)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_rejects_bad_lengths() {
        assert!(Image::new(2, 2, vec![0; 16]).is_ok());
        assert!(Image::new(2, 2, vec![0; 15]).is_err());
        assert!(Image::new(0, 2, vec![]).is_err());
        assert!(Image::new(2, 0, vec![]).is_err());
    }

    #[test]
    fn test_image_pixel_access() -> Result<()> {
        let mut pixels = vec![0u8; 2 * 2 * 4];
        pixels[4..8].copy_from_slice(&[1, 2, 3, 4]);
        let image = Image::new(2, 2, pixels)?;
        assert_eq!(image.pixel(1, 0), [1, 2, 3, 4]);
        assert_eq!(image.alpha(), vec![0, 4, 0, 0]);
        Ok(())
    }

    #[test]
    fn test_backend_tag_serde_names() {
        assert_eq!(BackendTag::VectorizedCpu.to_string(), "vectorized-cpu");
        assert_eq!(BackendTag::PRIORITY[0], BackendTag::HardwareAccelerated);
        assert!(Stage::Ready.is_terminal());
        assert!(!Stage::Loading.is_terminal());
    }
}
