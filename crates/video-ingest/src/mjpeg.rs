//! Multipart JPEG over HTTP(S), the format served by phone "IP webcam" apps and
//! most network cameras.

use std::io::Read;

use image::ImageFormat;
use reqwest::blocking::Client;
use tracing::trace;

use crate::{
    CaptureOptions, FrameReader, VideoSource,
    types::{CaptureError, Frame, FrameFormat},
};

const CHUNK_SIZE: usize = 64 * 1024;
/// Upper bound for a single buffered JPEG before the buffer is considered garbage.
const MAX_JPEG_BYTES: usize = 8 * 1024 * 1024;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

pub struct MjpegHttpSource {
    uri: String,
    client: Client,
}

impl MjpegHttpSource {
    pub fn new(uri: &str, options: &CaptureOptions) -> Result<Self, CaptureError> {
        // `timeout` on the blocking client bounds every body read, not just the request.
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.read_timeout)
            .build()
            .map_err(|err| CaptureError::Open {
                uri: uri.to_string(),
                reason: format!("failed to build HTTP client: {err}"),
            })?;
        Ok(Self {
            uri: uri.to_string(),
            client,
        })
    }
}

impl VideoSource for MjpegHttpSource {
    fn describe(&self) -> &str {
        &self.uri
    }

    fn open(&self) -> Result<Box<dyn FrameReader>, CaptureError> {
        let response = self
            .client
            .get(&self.uri)
            .send()
            .map_err(|err| CaptureError::Open {
                uri: self.uri.clone(),
                reason: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(CaptureError::Open {
                uri: self.uri.clone(),
                reason: format!("server responded with status {}", response.status()),
            });
        }
        Ok(Box::new(MjpegReader::new(self.uri.clone(), response)))
    }
}

/// Splits a byte stream into JPEG images using the SOI/EOI markers.
pub(crate) struct MjpegReader<R> {
    uri: String,
    reader: R,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
}

impl<R: Read> MjpegReader<R> {
    pub(crate) fn new(uri: String, reader: R) -> Self {
        Self {
            uri,
            reader,
            buffer: Vec::with_capacity(CHUNK_SIZE * 2),
            chunk: vec![0u8; CHUNK_SIZE],
        }
    }

    /// Return the newest complete JPEG, reading more data when none is buffered.
    pub(crate) fn read_next_jpeg(&mut self) -> Result<Vec<u8>, CaptureError> {
        loop {
            if let Some(jpeg) = take_latest_jpeg(&mut self.buffer) {
                return Ok(jpeg);
            }

            let read = self
                .reader
                .read(&mut self.chunk)
                .map_err(|err| CaptureError::Read {
                    uri: self.uri.clone(),
                    reason: err.to_string(),
                })?;
            if read == 0 {
                return Err(CaptureError::EndOfStream {
                    uri: self.uri.clone(),
                });
            }
            trace!("MJPEG read {} bytes", read);
            self.buffer.extend_from_slice(&self.chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES {
                return Err(CaptureError::Read {
                    uri: self.uri.clone(),
                    reason: format!("no complete JPEG within {MAX_JPEG_BYTES} bytes"),
                });
            }
        }
    }
}

impl<R: Read + Send> FrameReader for MjpegReader<R> {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let jpeg = self.read_next_jpeg()?;
        let image = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
            .map_err(|err| CaptureError::Read {
                uri: self.uri.clone(),
                reason: format!("failed to decode {} byte JPEG: {err}", jpeg.len()),
            })?
            .into_rgb8();
        let (width, height) = image.dimensions();
        Ok(Frame::from_raw(image.into_raw(), width, height, FrameFormat::Rgb8))
    }
}

/// Remove every complete JPEG from `buffer` and return the last one.
///
/// Older complete images are discarded so a reader that fell behind jumps
/// straight to the freshest frame.
fn take_latest_jpeg(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let mut latest = None;
    let mut consumed = 0;
    while let Some((start, end)) = find_jpeg_bounds(&buffer[consumed..]) {
        latest = Some((consumed + start, consumed + end));
        consumed += end;
    }

    let Some((start, end)) = latest else {
        // Keep only the tail starting at a pending SOI so garbage cannot accumulate.
        match find_marker(buffer, &SOI) {
            Some(start) if start > 0 => {
                buffer.drain(..start);
            }
            None if buffer.len() > 1 => {
                let keep_from = buffer.len() - 1;
                buffer.drain(..keep_from);
            }
            _ => {}
        }
        return None;
    };

    let jpeg = buffer[start..end].to_vec();
    buffer.drain(..end);
    Some(jpeg)
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = find_marker(buffer, &SOI)?;
    let body = start + SOI.len();
    let end = find_marker(&buffer[body..], &EOI)?;
    Some((start, body + end + EOI.len()))
}

fn find_marker(buffer: &[u8], marker: &[u8]) -> Option<usize> {
    buffer
        .windows(marker.len())
        .position(|window| window == marker)
}
