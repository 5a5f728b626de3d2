//! Greedy, class-aware non-maximum suppression.

use crate::detector::Detection;

/// Keep the highest scoring box of every overlapping group of the same class.
///
/// Boxes of different classes never suppress each other. The result is sorted
/// by descending score.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|existing| {
            existing.class_id == candidate.class_id && existing.iou(&candidate) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
