//! Camera capture backends.
//!
//! A [`VideoSource`] knows how to (re)open a camera stream; every successful
//! open yields a [`FrameReader`] that owns the live connection. Dropping the
//! reader releases the connection, so callers reconnect by simply opening the
//! source again.

use std::{fmt, str::FromStr, time::Duration};

mod ffmpeg;
mod mjpeg;
#[cfg(feature = "opencv")]
mod camera;
mod types;

#[cfg(feature = "opencv")]
pub use camera::OpencvSource;
pub use ffmpeg::FfmpegSource;
pub use mjpeg::MjpegHttpSource;
pub use types::{CaptureError, Frame, FrameFormat};

/// Something that can open a live camera connection.
pub trait VideoSource: Send + Sync {
    /// Human readable identifier, normally the configured URI.
    fn describe(&self) -> &str;

    /// Establish a new connection to the stream.
    fn open(&self) -> Result<Box<dyn FrameReader>, CaptureError>;
}

/// A live connection that yields frames until it fails.
pub trait FrameReader: Send {
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// Capture backend used to decode the camera stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureBackend {
    /// Pick by URI scheme.
    #[default]
    Auto,
    /// Multipart JPEG over HTTP(S).
    Mjpeg,
    /// `ffmpeg` child process (RTSP, UDP and anything else ffmpeg decodes).
    Ffmpeg,
    /// OpenCV `VideoCapture`, requires the `opencv` feature.
    Opencv,
}

impl CaptureBackend {
    /// Resolve `Auto` into a concrete backend for `uri`.
    pub fn resolve(self, uri: &str) -> CaptureBackend {
        if self != CaptureBackend::Auto {
            return self;
        }
        let lower = uri.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            CaptureBackend::Mjpeg
        } else if lower.starts_with("rtsp://")
            || lower.starts_with("rtsps://")
            || lower.starts_with("udp://")
        {
            CaptureBackend::Ffmpeg
        } else {
            CaptureBackend::Opencv
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CaptureBackend::Auto => "auto",
            CaptureBackend::Mjpeg => "mjpeg",
            CaptureBackend::Ffmpeg => "ffmpeg",
            CaptureBackend::Opencv => "opencv",
        }
    }
}

impl fmt::Display for CaptureBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CaptureBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(CaptureBackend::Auto),
            "mjpeg" | "http" => Ok(CaptureBackend::Mjpeg),
            "ffmpeg" => Ok(CaptureBackend::Ffmpeg),
            "opencv" => Ok(CaptureBackend::Opencv),
            other => Err(format!(
                "unknown capture backend {other:?} (expected auto, mjpeg, ffmpeg or opencv)"
            )),
        }
    }
}

/// Transport settings shared by all backends.
#[derive(Clone, Debug)]
pub struct CaptureOptions {
    pub backend: CaptureBackend,
    /// Output size for backends that must know it up front (ffmpeg raw video).
    pub target_size: (u32, u32),
    pub connect_timeout: Duration,
    /// Longest a single read may block before the connection is considered dead.
    pub read_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            backend: CaptureBackend::Auto,
            target_size: (1280, 720),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
        }
    }
}

/// Build the video source for `uri` according to `options`.
///
/// This only validates the configuration; no connection is attempted until
/// [`VideoSource::open`] is called.
pub fn open_source(
    uri: &str,
    options: &CaptureOptions,
) -> Result<Box<dyn VideoSource>, CaptureError> {
    match options.backend.resolve(uri) {
        CaptureBackend::Mjpeg => Ok(Box::new(MjpegHttpSource::new(uri, options)?)),
        CaptureBackend::Ffmpeg => Ok(Box::new(FfmpegSource::new(
            uri,
            options.target_size,
            options.read_timeout,
        ))),
        CaptureBackend::Opencv => opencv_source(uri),
        CaptureBackend::Auto => unreachable!("resolve never returns Auto"),
    }
}

#[cfg(feature = "opencv")]
fn opencv_source(uri: &str) -> Result<Box<dyn VideoSource>, CaptureError> {
    Ok(Box::new(OpencvSource::new(uri)))
}

#[cfg(not(feature = "opencv"))]
fn opencv_source(uri: &str) -> Result<Box<dyn VideoSource>, CaptureError> {
    Err(CaptureError::Unsupported {
        uri: uri.to_string(),
        reason: "built without the `opencv` feature; use an http(s), rtsp or udp URL".into(),
    })
}
