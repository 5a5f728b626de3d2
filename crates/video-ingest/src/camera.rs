//! OpenCV-backed capture for devices, files and any URL `VideoCapture` accepts.

use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::debug;

use crate::{
    FrameReader, VideoSource,
    types::{CaptureError, Frame, FrameFormat},
};

pub struct OpencvSource {
    uri: String,
}

impl OpencvSource {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
        }
    }

    fn open_capture(&self) -> Result<VideoCapture, CaptureError> {
        let open_error = |reason: String| CaptureError::Open {
            uri: self.uri.clone(),
            reason,
        };

        let capture = match parse_device_index(&self.uri) {
            Some(index) => VideoCapture::new(index, videoio::CAP_ANY),
            None => VideoCapture::from_file(&self.uri, videoio::CAP_ANY),
        }
        .map_err(|err| open_error(err.to_string()))?;

        if !capture
            .is_opened()
            .map_err(|err| open_error(err.to_string()))?
        {
            return Err(open_error("VideoCapture did not open".into()));
        }
        Ok(capture)
    }
}

impl VideoSource for OpencvSource {
    fn describe(&self) -> &str {
        &self.uri
    }

    fn open(&self) -> Result<Box<dyn FrameReader>, CaptureError> {
        let mut capture = self.open_capture()?;
        // Keep at most one decoded frame queued inside the backend.
        if !matches!(capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0), Ok(true)) {
            debug!("capture backend for {} ignored CAP_PROP_BUFFERSIZE", self.uri);
        }
        Ok(Box::new(OpencvReader {
            uri: self.uri.clone(),
            capture,
            frame: Mat::default(),
        }))
    }
}

struct OpencvReader {
    uri: String,
    capture: VideoCapture,
    frame: Mat,
}

impl OpencvReader {
    fn read_error(&self, reason: impl Into<String>) -> CaptureError {
        CaptureError::Read {
            uri: self.uri.clone(),
            reason: reason.into(),
        }
    }
}

impl FrameReader for OpencvReader {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let grabbed = self
            .capture
            .read(&mut self.frame)
            .map_err(|err| self.read_error(err.to_string()))?;
        if !grabbed || self.frame.cols() <= 0 || self.frame.rows() <= 0 {
            return Err(self.read_error("capture returned no frame"));
        }
        if self.frame.channels() != 3 {
            return Err(self.read_error(format!(
                "expected 3 channel frames, got {}",
                self.frame.channels()
            )));
        }

        let data = self
            .frame
            .data_bytes()
            .map_err(|err| self.read_error(err.to_string()))?
            .to_vec();
        Ok(Frame::from_raw(
            data,
            self.frame.cols() as u32,
            self.frame.rows() as u32,
            FrameFormat::Bgr8,
        ))
    }
}

impl Drop for OpencvReader {
    fn drop(&mut self) {
        let _ = self.capture.release();
    }
}

/// Parse a `/dev/videoX` style URI (or a bare index) into a device index.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse::<i32>().ok();
    }
    None
}
