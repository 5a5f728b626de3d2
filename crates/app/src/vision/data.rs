use std::sync::OnceLock;

use actix_web::web::Bytes;
use anyhow::Result;
use chrono::Utc;
use ml_core::DetectionBatch;
use serde::Serialize;
use video_ingest::Frame;

use crate::vision::encoding::encode_jpeg;

/// Annotated frame as stored in the published slot.
///
/// Immutable once published; readers share it through an `Arc`. The JPEG is
/// encoded by the first reader that needs it and cached for everyone else
/// asking for the same quality.
pub(crate) struct PublishedFrame {
    pub(crate) frame: Frame,
    pub(crate) detections: Vec<DetectionSummary>,
    pub(crate) frame_number: u64,
    pub(crate) published_at_ms: i64,
    jpeg: OnceLock<(u8, Bytes)>,
}

impl PublishedFrame {
    pub(crate) fn new(frame: Frame, detections: Vec<DetectionSummary>, frame_number: u64) -> Self {
        Self {
            frame,
            detections,
            frame_number,
            published_at_ms: Utc::now().timestamp_millis(),
            jpeg: OnceLock::new(),
        }
    }

    /// JPEG encoding of the annotated frame.
    ///
    /// Only the first quality requested is cached; other qualities are encoded
    /// on every call.
    pub(crate) fn jpeg(&self, quality: u8) -> Result<Bytes> {
        if let Some((cached_quality, jpeg)) = self.jpeg.get() {
            if *cached_quality == quality {
                return Ok(jpeg.clone());
            }
            return encode_jpeg(&self.frame, quality);
        }
        let encoded = encode_jpeg(&self.frame, quality)?;
        // A concurrent reader may have won the race with another quality.
        let (cached_quality, jpeg) = self.jpeg.get_or_init(|| (quality, encoded.clone()));
        if *cached_quality == quality {
            Ok(jpeg.clone())
        } else {
            Ok(encoded)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct DetectionSummary {
    pub(crate) class: String,
    pub(crate) score: f32,
    pub(crate) bbox: [f32; 4],
}

impl DetectionSummary {
    pub(crate) fn from_batch(batch: &DetectionBatch) -> Vec<Self> {
        batch
            .detections
            .iter()
            .map(|det| DetectionSummary {
                class: det.label().to_string(),
                score: det.score,
                bbox: det.bbox,
            })
            .collect()
    }
}

#[derive(Serialize)]
pub(crate) struct DetectionsResponse<'a> {
    pub(crate) frame_number: u64,
    pub(crate) captured_at_ms: i64,
    pub(crate) published_at_ms: i64,
    pub(crate) detections: &'a [DetectionSummary],
}

impl<'a> From<&'a PublishedFrame> for DetectionsResponse<'a> {
    fn from(packet: &'a PublishedFrame) -> Self {
        Self {
            frame_number: packet.frame_number,
            captured_at_ms: packet.frame.timestamp_ms,
            published_at_ms: packet.published_at_ms,
            detections: &packet.detections,
        }
    }
}
