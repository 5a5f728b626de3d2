//! Object detection collaborators for the streaming pipeline.
//!
//! The pipeline only depends on [`ObjectDetector`]; concrete backends live in
//! their own modules. The TorchScript backend is compiled with the `with-tch`
//! feature so default builds do not need libtorch.

pub mod detector;
pub mod labels;
pub mod nms;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use detector::{Detection, DetectionBatch, DetectorError, NullDetector, ObjectDetector};
#[cfg(feature = "with-tch")]
pub use torch::TorchDetector;

#[cfg(feature = "with-tch")]
pub use tch;
