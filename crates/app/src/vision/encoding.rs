//! JPEG encoding and multipart framing for the preview stream.

use actix_web::web::Bytes;
use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use video_ingest::Frame;

/// Multipart boundary token advertised in the stream's content type.
pub(crate) const STREAM_BOUNDARY: &str = "frame";
pub(crate) const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Encode `frame` as a baseline JPEG.
pub(crate) fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Bytes> {
    let rgb = frame
        .to_rgb_image()
        .context("annotated frame is not a valid RGB image")?;
    let mut buffer = Vec::with_capacity(rgb.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&rgb)
        .context("JPEG encode failed")?;
    Ok(Bytes::from(buffer))
}

/// Wrap one JPEG as a part of the `multipart/x-mixed-replace` stream.
pub(crate) fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(jpeg.len() + 64);
    payload.extend_from_slice(b"--");
    payload.extend_from_slice(STREAM_BOUNDARY.as_bytes());
    payload.extend_from_slice(b"\r\n");
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn parts_carry_boundary_and_content_type() {
        let part = multipart_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(
            part.as_ref(),
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\xFF\xD9\r\n"
        );
    }

    #[test]
    fn encoded_frames_decode_to_the_same_size() {
        let frame = Frame::from_rgb_image(RgbImage::from_pixel(16, 8, Rgb([0, 128, 255])), 0);
        let jpeg = encode_jpeg(&frame, 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }
}
