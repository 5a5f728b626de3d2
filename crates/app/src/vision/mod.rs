//! Camera-to-browser detection pipeline.
//!
//! The module is split into focused submodules:
//! - `config`: CLI and environment configuration.
//! - `capture`: Camera reconnect loop feeding the latest-frame slot.
//! - `slot`: Single-frame hand-off buffers between stages.
//! - `processing`: Detector worker that annotates and publishes frames.
//! - `annotation`: Box and caption drawing.
//! - `encoding`: JPEG encoding and multipart framing.
//! - `server`: Actix Web stream and status endpoints.
//! - `watchdog`: Heartbeats, counters and stall reporting.
//! - `pipeline`: Supervisor wiring every stage together.
//! - `shutdown`: Cancellation token observed by every loop.
//! - `telemetry`: Tracing and Prometheus setup.
//! - `data`: Values shared between the detector and the server.

/// Re-export pipeline settings so callers can configure runs without reaching
/// into submodules.
pub use config::{StreamCliArgs, StreamConfig};
/// Launch the pipeline with a ready-made configuration.
pub use pipeline::run;

mod annotation;
mod capture;
mod config;
mod data;
mod encoding;
mod pipeline;
mod processing;
mod server;
mod shutdown;
mod slot;
mod telemetry;
mod watchdog;
