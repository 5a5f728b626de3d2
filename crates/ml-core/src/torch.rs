//! TorchScript YOLOv8 backend.
//!
//! Expects a model exported with `yolo export format=torchscript`, whose output
//! is `[1, 4 + classes, anchors]` with boxes as centre/size in detector pixels.

use std::{convert::TryFrom, path::Path};

use image::{RgbImage, imageops::FilterType};
use tch::{self, Device, Kind, Tensor};

use crate::{
    detector::{Detection, DetectionBatch, DetectorError, ObjectDetector},
    nms::non_max_suppression,
};

const MAX_DETECTIONS: usize = 300;

/// TorchScript-backed detector wrapper.
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (u32, u32),
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TorchDetector {
    /// Load a TorchScript module onto `device`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (u32, u32),
    ) -> Result<Self, DetectorError> {
        let path = model_path.as_ref();
        let mut module =
            tch::CModule::load_on_device(path, device).map_err(|err| DetectorError::Load {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        module.set_eval();
        Ok(Self {
            module,
            device,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the confidence threshold used for filtering detections.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    /// Override the IoU above which same-class boxes are merged.
    pub fn with_iou_threshold(mut self, iou: f32) -> Self {
        self.iou_threshold = iou;
        self
    }

    fn to_tensor(&self, image: &RgbImage) -> Tensor {
        let (in_w, in_h) = self.input_size;
        let resized = image::imageops::resize(image, in_w, in_h, FilterType::Triangle);
        Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h as i64, in_w as i64, 3])
            .permute([0, 3, 1, 2])
            / 255.0
    }
}

impl ObjectDetector for TorchDetector {
    fn describe(&self) -> String {
        format!(
            "TorchScript YOLO on {:?} ({}x{} input)",
            self.device, self.input_size.0, self.input_size.1
        )
    }

    fn infer(&mut self, image: &RgbImage) -> Result<DetectionBatch, DetectorError> {
        let input = self.to_tensor(image);
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|err| DetectorError::Inference(err.to_string()))?;

        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(DetectorError::Output(format!(
                "expected [1, 4 + classes, anchors], got {shape:?}"
            )));
        }
        if shape[1] < 5 {
            return Err(DetectorError::Output(format!(
                "need at least 5 channels (cx, cy, w, h, class scores), got {}",
                shape[1]
            )));
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows = Vec::<Vec<f32>>::try_from(&preds)
            .map_err(|err| DetectorError::Output(err.to_string()))?;

        let (in_w, in_h) = self.input_size;
        let scale_x = image.width() as f32 / in_w as f32;
        let scale_y = image.height() as f32 / in_h as f32;
        let max_x = image.width().saturating_sub(1) as f32;
        let max_y = image.height().saturating_sub(1) as f32;

        let candidates = rows
            .iter()
            .filter_map(|row| decode_row(row, self.confidence_threshold))
            .map(|mut det| {
                det.bbox = [
                    (det.bbox[0] * scale_x).clamp(0.0, max_x),
                    (det.bbox[1] * scale_y).clamp(0.0, max_y),
                    (det.bbox[2] * scale_x).clamp(0.0, max_x),
                    (det.bbox[3] * scale_y).clamp(0.0, max_y),
                ];
                det
            })
            .collect();

        let mut detections = non_max_suppression(candidates, self.iou_threshold);
        detections.truncate(MAX_DETECTIONS);
        Ok(DetectionBatch { detections })
    }
}

/// Turn one `[cx, cy, w, h, score_0, .., score_n]` row into a detection in
/// detector pixel space.
fn decode_row(row: &[f32], confidence_threshold: f32) -> Option<Detection> {
    let (class_idx, score) = row
        .get(4..)?
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    if score < confidence_threshold {
        return None;
    }
    let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
    Some(Detection {
        bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
        score,
        class_id: class_idx as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_pick_the_best_class() {
        let det = decode_row(&[50.0, 40.0, 20.0, 10.0, 0.1, 0.8, 0.3], 0.25).unwrap();
        assert_eq!(det.class_id, 1);
        assert_eq!(det.bbox, [40.0, 35.0, 60.0, 45.0]);
    }

    #[test]
    fn low_confidence_rows_are_dropped() {
        assert!(decode_row(&[1.0, 1.0, 1.0, 1.0, 0.1, 0.2], 0.25).is_none());
        assert!(decode_row(&[1.0, 1.0, 1.0], 0.25).is_none());
    }
}
