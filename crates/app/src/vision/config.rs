//! Configuration parsing for the streaming pipeline.
//!
//! This module owns translation of CLI arguments and environment variables
//! into a `StreamConfig` which downstream stages use without re-parsing flags.

use std::{net::IpAddr, path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::Args;
use video_ingest::{CaptureBackend, CaptureOptions};

use crate::vision::capture::RetryPolicy;

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage in the pipeline.
pub struct StreamConfig {
    /// Camera stream URL or device identifier.
    pub camera_url: String,
    /// Decoder used for the camera stream.
    pub capture_backend: CaptureBackend,
    /// Frame size requested from decoders that rescale.
    pub capture_size: (u32, u32),
    /// Socket timeout for a single camera read.
    pub read_timeout: Duration,
    /// Delay schedule between reconnect attempts.
    pub retry: RetryPolicy,
    /// Interface the HTTP server binds to.
    pub bind_addr: IpAddr,
    /// Port the HTTP server listens on.
    pub listen_port: u16,
    /// TorchScript model loaded by the detector.
    pub model_path: PathBuf,
    /// Square detector input size in pixels.
    pub detector_size: u32,
    /// Minimum score for a detection to be drawn.
    pub confidence: f32,
    /// IoU above which same-class boxes are merged.
    pub iou: f32,
    /// JPEG quality for streamed frames.
    pub jpeg_quality: u8,
    /// Force CPU inference.
    pub use_cpu: bool,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug, Default)]
/// Logging and tracing knobs.
pub struct TelemetryOptions {
    /// Log at debug level and print per-frame detections.
    pub verbose: bool,
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments accepted by `detect-stream`.
#[derive(Debug, Args)]
pub struct StreamCliArgs {
    /// Camera stream URL (http(s) MJPEG, rtsp://, udp://, device path).
    #[arg(long = "camera-url", env = "CAMERA_URL", value_name = "URL")]
    pub camera_url: Option<String>,
    /// Port the MJPEG server listens on.
    #[arg(long = "listen-port", env = "LISTEN_PORT", default_value_t = 5050)]
    pub listen_port: u16,
    /// Interface the MJPEG server binds to.
    #[arg(long = "bind", env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind: String,
    /// TorchScript detector weights.
    #[arg(
        long = "model",
        env = "MODEL_PATH",
        value_name = "PATH",
        default_value = "yolov8n.torchscript"
    )]
    pub model_path: PathBuf,
    /// Capture decoder: auto, mjpeg, ffmpeg or opencv.
    #[arg(long = "capture-backend", default_value = "auto")]
    pub capture_backend: CaptureBackend,
    /// Output width for decoders that rescale.
    #[arg(long = "width", value_name = "PX", default_value_t = 1280)]
    pub width: u32,
    /// Output height for decoders that rescale.
    #[arg(long = "height", value_name = "PX", default_value_t = 720)]
    pub height: u32,
    /// Camera read timeout in milliseconds.
    #[arg(long = "read-timeout-ms", value_name = "MS", default_value_t = 10_000)]
    pub read_timeout_ms: u64,
    /// First reconnect delay in milliseconds.
    #[arg(long = "retry-delay-ms", value_name = "MS", default_value_t = 2_000)]
    pub retry_delay_ms: u64,
    /// Upper bound for the reconnect delay in milliseconds.
    #[arg(long = "max-retry-delay-ms", value_name = "MS", default_value_t = 30_000)]
    pub max_retry_delay_ms: u64,
    /// Growth factor between reconnect delays. The default doubles the delay
    /// up to --max-retry-delay-ms; pass 1.0 for a constant delay.
    #[arg(long = "retry-multiplier", value_name = "FACTOR", default_value_t = 2.0)]
    pub retry_multiplier: f64,
    /// Detector input size in pixels (square, multiple of 32).
    #[arg(long = "detector-size", value_name = "PX", default_value_t = 640)]
    pub detector_size: u32,
    /// Minimum detection confidence.
    #[arg(long = "confidence", default_value_t = 0.25)]
    pub confidence: f32,
    /// IoU threshold for non-maximum suppression.
    #[arg(long = "iou", default_value_t = 0.45)]
    pub iou: f32,
    /// JPEG quality used by the stream encoder (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Enable verbose logging (reconnects, detections).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<StreamCliArgs> for StreamConfig {
    type Error = anyhow::Error;

    fn try_from(args: StreamCliArgs) -> Result<Self> {
        let camera_url = args
            .camera_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow!("Missing camera. Provide --camera-url <url> or CAMERA_URL."))?;

        let bind_addr = args
            .bind
            .parse::<IpAddr>()
            .map_err(|err| anyhow!("--bind must be an IP address ({}): {err}", args.bind))?;

        if args.width == 0 || args.height == 0 {
            bail!("Capture width and height must be positive integers");
        }
        if args.read_timeout_ms == 0 {
            bail!("--read-timeout-ms must be greater than zero");
        }
        if args.retry_delay_ms == 0 {
            bail!("--retry-delay-ms must be greater than zero");
        }
        if args.max_retry_delay_ms < args.retry_delay_ms {
            bail!("--max-retry-delay-ms must not be smaller than --retry-delay-ms");
        }
        if !args.retry_multiplier.is_finite() || args.retry_multiplier < 1.0 {
            bail!("--retry-multiplier must be at least 1.0");
        }
        if args.detector_size == 0 || args.detector_size % 32 != 0 {
            bail!("--detector-size must be a positive multiple of 32");
        }
        if !(args.confidence > 0.0 && args.confidence <= 1.0) {
            bail!("--confidence must be in (0, 1]");
        }
        if !(args.iou > 0.0 && args.iou <= 1.0) {
            bail!("--iou must be in (0, 1]");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        Ok(Self {
            camera_url,
            capture_backend: args.capture_backend,
            capture_size: (args.width, args.height),
            read_timeout: Duration::from_millis(args.read_timeout_ms),
            retry: RetryPolicy {
                initial: Duration::from_millis(args.retry_delay_ms),
                max: Duration::from_millis(args.max_retry_delay_ms),
                multiplier: args.retry_multiplier,
            },
            bind_addr,
            listen_port: args.listen_port,
            model_path: args.model_path,
            detector_size: args.detector_size,
            confidence: args.confidence,
            iou: args.iou,
            jpeg_quality: args.jpeg_quality,
            use_cpu: args.use_cpu,
            telemetry: TelemetryOptions {
                verbose: args.verbose,
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

impl StreamConfig {
    /// Options handed to the capture backend.
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            backend: self.capture_backend,
            target_size: self.capture_size,
            read_timeout: self.read_timeout,
            ..CaptureOptions::default()
        }
    }
}
