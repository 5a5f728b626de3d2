use anyhow::{Error, anyhow};
use chrono::Utc;
use image::RgbImage;
use thiserror::Error;

/// Owned 8-bit, 3-channel frame captured from a video source.
///
/// A frame is never mutated after capture; the annotation stage builds a new
/// frame from the raw one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
    Rgb8,
}

impl Frame {
    /// Wrap an RGB image captured (or rendered) at `timestamp_ms`.
    pub fn from_rgb_image(image: RgbImage, timestamp_ms: i64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            timestamp_ms,
            format: FrameFormat::Rgb8,
        }
    }

    /// Build a frame from raw interleaved bytes stamped with the current time.
    pub fn from_raw(data: Vec<u8>, width: u32, height: u32, format: FrameFormat) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format,
        }
    }

    /// Number of bytes a well-formed frame of this size carries.
    pub fn expected_len(&self) -> usize {
        (self.width as usize) * (self.height as usize) * 3
    }

    /// Convert into an RGB image, swapping channels for BGR frames.
    pub fn to_rgb_image(&self) -> Result<RgbImage, CaptureError> {
        if self.data.len() != self.expected_len() {
            return Err(CaptureError::Other(anyhow!(
                "frame buffer holds {} bytes, expected {} for {}x{}",
                self.data.len(),
                self.expected_len(),
                self.width,
                self.height
            )));
        }
        let data = match self.format {
            FrameFormat::Rgb8 => self.data.clone(),
            FrameFormat::Bgr8 => bgr_to_rgb(&self.data),
        };
        RgbImage::from_raw(self.width, self.height, data)
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to wrap frame as an RGB image")))
    }
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}: {reason}")]
    Open { uri: String, reason: String },
    #[error("failed to read frame from {uri:?}: {reason}")]
    Read { uri: String, reason: String },
    #[error("video source {uri:?} ended")]
    EndOfStream { uri: String },
    #[error("no capture backend for {uri:?}: {reason}")]
    Unsupported { uri: String, reason: String },
    #[error(transparent)]
    Other(#[from] Error),
}
