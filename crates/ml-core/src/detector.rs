use image::RgbImage;
use thiserror::Error;

use crate::labels;

/// Single detection in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// `[left, top, right, bottom]`.
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

impl Detection {
    /// Class name for this detection, falling back to `object` for unknown ids.
    pub fn label(&self) -> &'static str {
        labels::coco_label(self.class_id)
    }

    pub fn area(&self) -> f32 {
        (self.bbox[2] - self.bbox[0]).max(0.0) * (self.bbox[3] - self.bbox[1]).max(0.0)
    }

    /// Intersection over union with `other`.
    pub fn iou(&self, other: &Detection) -> f32 {
        let left = self.bbox[0].max(other.bbox[0]);
        let top = self.bbox[1].max(other.bbox[1]);
        let right = self.bbox[2].min(other.bbox[2]);
        let bottom = self.bbox[3].min(other.bbox[3]);
        let intersection = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// Detections produced for a single frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionBatch {
    pub detections: Vec<Detection>,
}

impl DetectionBatch {
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("failed to load detector model {path:?}: {reason}")]
    Load { path: String, reason: String },
    #[error("unexpected detector output: {0}")]
    Output(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Maps an image to the objects found in it.
///
/// Implementations are created and used on a single worker thread, so they do
/// not need to be `Send`.
pub trait ObjectDetector {
    /// Short description used in startup logs.
    fn describe(&self) -> String;

    fn infer(&mut self, image: &RgbImage) -> Result<DetectionBatch, DetectorError>;
}

/// Detector that never finds anything; frames pass through unannotated.
#[derive(Debug, Default)]
pub struct NullDetector;

impl ObjectDetector for NullDetector {
    fn describe(&self) -> String {
        "pass-through (no model)".into()
    }

    fn infer(&mut self, _image: &RgbImage) -> Result<DetectionBatch, DetectorError> {
        Ok(DetectionBatch::default())
    }
}
