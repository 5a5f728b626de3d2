//! Pipeline supervisor tying together capture, detection, the watchdog and
//! the HTTP server.
//!
//! Every stage thread is expected to run until it is told to stop. If one of
//! them exits on its own (a panic escaping a stage loop, the server dying) the
//! whole run is torn down and rebuilt after a short pause. Failures that a
//! restart cannot fix, such as an unloadable model or a port that is already
//! taken, are returned to the caller instead.

use std::{
    sync::{Arc, Once},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use ml_core::ObjectDetector;
use tracing::{debug, error, info, warn};
use video_ingest::VideoSource;

use crate::vision::{
    StreamConfig,
    capture::spawn_capture_worker,
    processing::{DetectorFactory, ProcessingContext, spawn_processing_worker},
    server::{StreamServer, log_endpoints, spawn_stream_server},
    shutdown::ShutdownSignal,
    slot::{LatestFrameSlot, PublishedFrameSlot},
    telemetry,
    watchdog::{PipelineHealth, spawn_watchdog},
};

/// Pause before rebuilding a pipeline whose stage exited unexpectedly.
const RESTART_DELAY: Duration = Duration::from_secs(1);
/// How often the supervisor checks stage threads.
const SUPERVISOR_TICK: Duration = Duration::from_millis(250);

/// Run the streaming pipeline until Ctrl+C, restarting it on stage failures.
pub fn run(config: StreamConfig) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let _ = telemetry::init_metrics_recorder();

    let shutdown = ShutdownSignal::new();
    install_ctrlc_handler(shutdown.clone());

    let source: Arc<dyn VideoSource> = Arc::from(
        video_ingest::open_source(&config.camera_url, &config.capture_options())
            .with_context(|| format!("Invalid camera source {}", config.camera_url))?,
    );
    info!(
        camera = %config.camera_url,
        backend = %config.capture_backend.resolve(&config.camera_url),
        "Starting detect-stream"
    );

    supervise(&config, source, || build_detector_factory(&config), &shutdown)
}

fn install_ctrlc_handler(shutdown: ShutdownSignal) {
    static CTRL_HANDLER: Once = Once::new();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            info!("Shutdown requested");
            shutdown.trigger();
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
}

/// Keep a pipeline running until `shutdown` fires.
pub(crate) fn supervise(
    config: &StreamConfig,
    source: Arc<dyn VideoSource>,
    make_factory: impl Fn() -> DetectorFactory,
    shutdown: &ShutdownSignal,
) -> Result<()> {
    let mut attempt: u32 = 0;
    while !shutdown.is_triggered() {
        let pipeline_span = tracing::info_span!("stream.pipeline", attempt);
        let _span_guard = pipeline_span.enter();

        let run = PipelineRun::start(config, source.clone(), make_factory())?;
        let reason = loop {
            if shutdown.wait_timeout(SUPERVISOR_TICK) {
                break None;
            }
            if let Some(stage) = run.finished_stage() {
                break Some(stage);
            }
        };
        run.stop();

        let Some(stage) = reason else {
            break;
        };
        attempt = attempt.saturating_add(1);
        metrics::counter!("stream_pipeline_restarts_total").increment(1);
        error!("Pipeline stage `{stage}` exited unexpectedly, restart #{attempt}");
        if shutdown.wait_timeout(RESTART_DELAY) {
            break;
        }
    }
    info!("Pipeline stopped");
    Ok(())
}

/// One set of running stage threads sharing a pair of slots.
pub(crate) struct PipelineRun {
    stop: ShutdownSignal,
    stages: Vec<(&'static str, thread::JoinHandle<()>)>,
    server: Option<StreamServer>,
}

impl PipelineRun {
    /// Start every stage. Detector loading and server binding are awaited so
    /// their failures surface here.
    pub(crate) fn start(
        config: &StreamConfig,
        source: Arc<dyn VideoSource>,
        factory: DetectorFactory,
    ) -> Result<Self> {
        let stop = ShutdownSignal::new();
        let latest = Arc::new(LatestFrameSlot::new());
        let published = Arc::new(PublishedFrameSlot::new());
        let health = Arc::new(PipelineHealth::new());
        let mut run = Self {
            stop: stop.clone(),
            stages: Vec::with_capacity(3),
            server: None,
        };

        let (init_tx, init_rx) = crossbeam_channel::bounded::<std::result::Result<String, String>>(1);
        let processing = spawn_processing_worker(
            factory,
            ProcessingContext {
                input: latest.clone(),
                output: published.clone(),
                health: health.clone(),
                shutdown: stop.clone(),
                verbose: config.telemetry.verbose,
            },
            init_tx,
        )
        .context("Failed to spawn detector thread")?;
        run.stages.push(("detector", processing));

        match init_rx.recv() {
            Ok(Ok(message)) => info!("{message}"),
            Ok(Err(err)) => {
                run.stop();
                bail!(err);
            }
            Err(err) => {
                run.stop();
                bail!("Detector thread exited before reporting readiness: {err}");
            }
        }

        let server = match spawn_stream_server(
            published.clone(),
            health.clone(),
            config.jpeg_quality,
            (config.bind_addr, config.listen_port),
        ) {
            Ok(server) => server,
            Err(err) => {
                run.stop();
                return Err(err.context("Failed to start HTTP server"));
            }
        };
        log_endpoints(&server);
        run.server = Some(server);

        let capture = spawn_capture_worker(
            source,
            latest,
            health.clone(),
            config.retry.clone(),
            stop.clone(),
        );
        match capture {
            Ok(handle) => run.stages.push(("capture", handle)),
            Err(err) => {
                run.stop();
                return Err(err).context("Failed to spawn capture thread");
            }
        }

        match spawn_watchdog(health, stop) {
            Ok(handle) => run.stages.push(("watchdog", handle)),
            Err(err) => {
                run.stop();
                return Err(err).context("Failed to spawn watchdog thread");
            }
        }

        Ok(run)
    }

    /// Name of the first stage whose thread has exited, if any.
    pub(crate) fn finished_stage(&self) -> Option<&'static str> {
        if self.stop.is_triggered() {
            return None;
        }
        if let Some((name, _)) = self
            .stages
            .iter()
            .find(|(_, handle)| handle.is_finished())
        {
            return Some(name);
        }
        match &self.server {
            Some(server) if server.is_finished() => Some("http"),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn server(&self) -> Option<&StreamServer> {
        self.server.as_ref()
    }

    /// Stop every stage and wait for the threads to exit.
    pub(crate) fn stop(mut self) {
        self.stop.trigger();
        if let Some(server) = self.server.take() {
            server.stop();
        }
        for (name, handle) in self.stages.drain(..) {
            if handle.join().is_err() {
                warn!("Stage `{name}` panicked");
            } else {
                debug!("Stage `{name}` stopped");
            }
        }
    }
}

#[cfg(feature = "with-tch")]
fn build_detector_factory(config: &StreamConfig) -> DetectorFactory {
    use ml_core::{TorchDetector, tch::Device};

    let model_path = config.model_path.clone();
    let use_cpu = config.use_cpu;
    let size = config.detector_size;
    let confidence = config.confidence;
    let iou = config.iou;
    Box::new(move || {
        let device = if use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available()
        };
        let detector = TorchDetector::new(&model_path, device, (size, size))
            .with_context(|| format!("Failed to load model {}", model_path.display()))?
            .with_confidence_threshold(confidence)
            .with_iou_threshold(iou);
        Ok(Box::new(detector) as Box<dyn ObjectDetector>)
    })
}

#[cfg(not(feature = "with-tch"))]
fn build_detector_factory(config: &StreamConfig) -> DetectorFactory {
    let model_path = config.model_path.clone();
    Box::new(move || {
        warn!(
            "built without the `with-tch` feature; ignoring {} and streaming frames without detections",
            model_path.display()
        );
        Ok(Box::new(ml_core::NullDetector) as Box<dyn ObjectDetector>)
    })
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };

    use anyhow::anyhow;
    use image::{Rgb, RgbImage};
    use ml_core::{Detection, DetectionBatch, DetectorError};
    use video_ingest::{
        CaptureBackend, CaptureError, CaptureOptions, Frame, FrameReader, MjpegHttpSource,
    };

    use super::*;
    use crate::vision::{capture::RetryPolicy, config::TelemetryOptions};

    fn test_config() -> StreamConfig {
        StreamConfig {
            camera_url: "scripted://camera".into(),
            capture_backend: CaptureBackend::Auto,
            capture_size: (64, 48),
            read_timeout: Duration::from_secs(1),
            retry: RetryPolicy::constant(Duration::from_millis(10)),
            bind_addr: "127.0.0.1".parse().unwrap(),
            listen_port: 0,
            model_path: PathBuf::from("unused.torchscript"),
            detector_size: 640,
            confidence: 0.25,
            iou: 0.45,
            jpeg_quality: 90,
            use_cpu: true,
            telemetry: TelemetryOptions::default(),
        }
    }

    /// Serves solid 64x48 frames; panics on the opens listed in `panic_on`.
    struct ScriptedSource {
        opens: AtomicUsize,
        panic_on: &'static [usize],
    }

    impl ScriptedSource {
        fn new(panic_on: &'static [usize]) -> Self {
            Self {
                opens: AtomicUsize::new(0),
                panic_on,
            }
        }
    }

    impl VideoSource for ScriptedSource {
        fn describe(&self) -> &str {
            "scripted://camera"
        }

        fn open(&self) -> Result<Box<dyn FrameReader>, CaptureError> {
            let open = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on.contains(&open) {
                panic!("camera driver crashed on open #{open}");
            }
            Ok(Box::new(SolidReader))
        }
    }

    struct SolidReader;

    impl FrameReader for SolidReader {
        fn read_frame(&mut self) -> Result<Frame, CaptureError> {
            thread::sleep(Duration::from_millis(10));
            Ok(Frame::from_rgb_image(
                RgbImage::from_pixel(64, 48, Rgb([40, 90, 160])),
                0,
            ))
        }
    }

    struct CentreDetector;

    impl ObjectDetector for CentreDetector {
        fn describe(&self) -> String {
            "centre".into()
        }

        fn infer(&mut self, image: &RgbImage) -> Result<DetectionBatch, DetectorError> {
            Ok(DetectionBatch {
                detections: vec![Detection {
                    bbox: [
                        image.width() as f32 / 4.0,
                        image.height() as f32 / 4.0,
                        image.width() as f32 * 0.75,
                        image.height() as f32 * 0.75,
                    ],
                    score: 0.9,
                    class_id: 0,
                }],
            })
        }
    }

    fn centre_factory() -> DetectorFactory {
        Box::new(|| Ok(Box::new(CentreDetector) as Box<dyn ObjectDetector>))
    }

    #[test]
    fn annotated_stream_is_readable_by_an_mjpeg_client() {
        let run = PipelineRun::start(
            &test_config(),
            Arc::new(ScriptedSource::new(&[])),
            centre_factory(),
        )
        .unwrap();
        let addr = run.server().unwrap().local_addrs()[0];

        let client = MjpegHttpSource::new(
            &format!("http://{addr}/video_feed"),
            &CaptureOptions::default(),
        )
        .unwrap();
        let mut reader = client.open().unwrap();
        let frame = reader.read_frame().unwrap();
        assert_eq!((frame.width, frame.height), (64, 48));
        // Box outline drawn by the annotator sits at the quarter mark.
        let image = frame.to_rgb_image().unwrap();
        let background = image.get_pixel(2, 46);
        let outline = image.get_pixel(16, 30);
        assert_ne!(background, outline);

        drop(reader);
        assert!(run.finished_stage().is_none());
        run.stop();
    }

    #[test]
    fn detector_load_failure_is_fatal() {
        let result = PipelineRun::start(
            &test_config(),
            Arc::new(ScriptedSource::new(&[])),
            Box::new(|| Err(anyhow!("weights not found"))),
        );
        let err = result.err().expect("start must fail");
        assert!(format!("{err:#}").contains("weights not found"));
    }

    #[test]
    fn crashed_stage_triggers_a_restart() {
        let source = Arc::new(ScriptedSource::new(&[1]));
        let shutdown = ShutdownSignal::new();
        let supervisor = {
            let source = source.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || supervise(&test_config(), source, centre_factory, &shutdown))
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while source.opens.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        shutdown.trigger();
        supervisor.join().unwrap().unwrap();
        assert!(source.opens.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn supervisor_returns_once_shutdown_is_requested() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        supervise(
            &test_config(),
            Arc::new(ScriptedSource::new(&[])),
            centre_factory,
            &shutdown,
        )
        .unwrap();
    }
}
