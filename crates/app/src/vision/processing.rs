//! Detector worker: pulls the newest frame, runs inference, draws the result
//! and publishes it for the stream endpoints.
//!
//! The detector is built on the worker thread itself because TorchScript
//! modules are not `Send`. A failed or panicking inference skips that frame
//! only; the loop keeps going with the next one.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::Sender;
use ml_core::{DetectionBatch, ObjectDetector};
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::vision::{
    annotation::annotate,
    data::{DetectionSummary, PublishedFrame},
    shutdown::ShutdownSignal,
    slot::{LatestFrameSlot, PublishedFrameSlot},
    telemetry,
    watchdog::{HealthComponent, PipelineHealth},
};

/// How long the worker sleeps on an empty slot before re-checking shutdown.
const IDLE_WAIT: Duration = Duration::from_millis(200);

/// Builds the detector on the worker thread.
pub(crate) type DetectorFactory = Box<dyn FnOnce() -> Result<Box<dyn ObjectDetector>> + Send>;

/// Slots and shared state a processing worker operates on.
pub(crate) struct ProcessingContext {
    pub(crate) input: Arc<LatestFrameSlot>,
    pub(crate) output: Arc<PublishedFrameSlot>,
    pub(crate) health: Arc<PipelineHealth>,
    pub(crate) shutdown: ShutdownSignal,
    pub(crate) verbose: bool,
}

/// Spawn the detector thread.
///
/// The outcome of building the detector is reported once on `init_tx`; on
/// failure the thread exits without processing anything.
pub(crate) fn spawn_processing_worker(
    factory: DetectorFactory,
    ctx: ProcessingContext,
    init_tx: Sender<std::result::Result<String, String>>,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("stream-detector", move || {
        let mut detector = match factory() {
            Ok(detector) => {
                if init_tx
                    .send(Ok(format!("detector ready: {}", detector.describe())))
                    .is_err()
                {
                    return;
                }
                detector
            }
            Err(err) => {
                let _ = init_tx.send(Err(format!("failed to load detector: {err:#}")));
                return;
            }
        };
        drop(init_tx);

        run_processing_loop(detector.as_mut(), &ctx);
    })
}

fn run_processing_loop(detector: &mut dyn ObjectDetector, ctx: &ProcessingContext) {
    let mut frame_number: u64 = 0;
    while !ctx.shutdown.is_triggered() {
        ctx.health.beat(HealthComponent::Detector);
        let Some(frame) = ctx
            .input
            .take_if_present()
            .or_else(|| ctx.input.wait_take(IDLE_WAIT))
        else {
            continue;
        };
        frame_number += 1;

        let span = tracing::info_span!(
            "detector.frame",
            frame = frame_number,
            width = frame.width,
            height = frame.height,
            timestamp = frame.timestamp_ms
        );
        let _guard = span.enter();

        match process_frame(detector, frame, frame_number, ctx.verbose) {
            Ok(published) => {
                ctx.output.publish(published);
                ctx.health.record_processed();
            }
            Err(err) => {
                ctx.health.record_detector_failure();
                warn!(frame = frame_number, "Skipping frame: {err:#}");
            }
        }
    }
    debug!("Detector loop stopped after {frame_number} frame(s)");
}

/// Run inference on `frame` and render the detections onto a copy of it.
pub(crate) fn process_frame(
    detector: &mut dyn ObjectDetector,
    frame: Frame,
    frame_number: u64,
    verbose: bool,
) -> Result<PublishedFrame> {
    let image = frame
        .to_rgb_image()
        .context("captured frame has an invalid pixel buffer")?;

    let started = Instant::now();
    let batch = run_inference(detector, &image)?;
    metrics::histogram!("stream_detector_inference_seconds")
        .record(started.elapsed().as_secs_f64());

    if verbose {
        log_detections(frame_number, &batch);
    }

    let summaries = DetectionSummary::from_batch(&batch);
    let annotated = annotate(image, &batch);
    Ok(PublishedFrame::new(
        Frame::from_rgb_image(annotated, frame.timestamp_ms),
        summaries,
        frame_number,
    ))
}

fn run_inference(
    detector: &mut dyn ObjectDetector,
    image: &image::RgbImage,
) -> Result<DetectionBatch> {
    match panic::catch_unwind(AssertUnwindSafe(|| detector.infer(image))) {
        Ok(result) => result.context("detector inference failed"),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow!("detector panicked: {message}"))
        }
    }
}

fn log_detections(frame_number: u64, batch: &DetectionBatch) {
    if batch.is_empty() {
        debug!("frame #{frame_number}: no detections");
        return;
    }
    debug!("frame #{frame_number}: {} detection(s)", batch.len());
    for (idx, det) in batch.detections.iter().enumerate() {
        debug!(
            "  #{idx}: class={} conf={:.3} bbox={:?}",
            det.label(),
            det.score,
            det.bbox
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use image::RgbImage;
    use ml_core::{Detection, DetectorError};
    use video_ingest::FrameFormat;

    use super::*;

    fn frame(id: u8) -> Frame {
        Frame {
            data: vec![id; 3],
            width: 1,
            height: 1,
            timestamp_ms: i64::from(id),
            format: FrameFormat::Rgb8,
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Detect,
        Fail,
        Panic,
    }

    /// Identifies frames by their first pixel and records what it saw.
    struct ScriptedDetector {
        seen: Arc<Mutex<Vec<u8>>>,
        script: fn(u8) -> Behaviour,
        delay: Duration,
    }

    impl ObjectDetector for ScriptedDetector {
        fn describe(&self) -> String {
            "scripted".into()
        }

        fn infer(&mut self, image: &RgbImage) -> Result<DetectionBatch, DetectorError> {
            let id = image.get_pixel(0, 0)[0];
            thread::sleep(self.delay);
            self.seen.lock().unwrap().push(id);
            match (self.script)(id) {
                Behaviour::Detect => Ok(DetectionBatch {
                    detections: vec![Detection {
                        bbox: [0.0, 0.0, 1.0, 1.0],
                        score: 0.9,
                        class_id: 0,
                    }],
                }),
                Behaviour::Fail => Err(DetectorError::Inference(format!("frame {id} rejected"))),
                Behaviour::Panic => panic!("frame {id} crashed the model"),
            }
        }
    }

    struct Harness {
        input: Arc<LatestFrameSlot>,
        output: Arc<PublishedFrameSlot>,
        health: Arc<PipelineHealth>,
        shutdown: ShutdownSignal,
        seen: Arc<Mutex<Vec<u8>>>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl Harness {
        fn start(script: fn(u8) -> Behaviour, delay: Duration) -> Self {
            let input = Arc::new(LatestFrameSlot::new());
            let output = Arc::new(PublishedFrameSlot::new());
            let health = Arc::new(PipelineHealth::new());
            let shutdown = ShutdownSignal::new();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let factory_seen = seen.clone();
            let factory: DetectorFactory = Box::new(move || {
                Ok(Box::new(ScriptedDetector {
                    seen: factory_seen,
                    script,
                    delay,
                }) as Box<dyn ObjectDetector>)
            });
            let (init_tx, init_rx) = crossbeam_channel::bounded(1);
            let handle = spawn_processing_worker(
                factory,
                ProcessingContext {
                    input: input.clone(),
                    output: output.clone(),
                    health: health.clone(),
                    shutdown: shutdown.clone(),
                    verbose: true,
                },
                init_tx,
            )
            .unwrap();
            assert!(init_rx.recv().unwrap().is_ok());
            Self {
                input,
                output,
                health,
                shutdown,
                seen,
                handle: Some(handle),
            }
        }

        fn wait_for_published(&self, id: u8) -> bool {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if let Some(published) = self.output.peek() {
                    if published.frame.timestamp_ms == i64::from(id) {
                        return true;
                    }
                }
                thread::sleep(Duration::from_millis(2));
            }
            false
        }

        fn wait_for_failures(&self, count: u64) -> bool {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if self.health.detector_failures() >= count {
                    return true;
                }
                thread::sleep(Duration::from_millis(2));
            }
            false
        }

        fn stop(mut self) -> Vec<u8> {
            self.shutdown.trigger();
            if let Some(handle) = self.handle.take() {
                handle.join().unwrap();
            }
            self.seen.lock().unwrap().clone()
        }
    }

    #[test]
    fn burst_of_frames_ends_with_the_newest() {
        let harness = Harness::start(|_| Behaviour::Detect, Duration::from_millis(50));
        harness.input.put(frame(1));
        harness.input.put(frame(2));
        harness.input.put(frame(3));
        assert!(harness.wait_for_published(3));
        let seen = harness.stop();

        assert_eq!(seen.last(), Some(&3));
        assert!(seen.len() <= 3);
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn inference_errors_and_panics_skip_only_that_frame() {
        let harness = Harness::start(
            |id| match id {
                1 => Behaviour::Fail,
                2 => Behaviour::Panic,
                _ => Behaviour::Detect,
            },
            Duration::ZERO,
        );

        harness.input.put(frame(1));
        assert!(harness.wait_for_failures(1));
        harness.input.put(frame(2));
        assert!(harness.wait_for_failures(2));
        harness.input.put(frame(3));
        assert!(harness.wait_for_published(3));

        let published = harness.output.peek().unwrap();
        assert_eq!(published.detections.len(), 1);
        assert_eq!(published.detections[0].class, "person");
        assert_eq!(harness.health.frames_processed(), 1);
        assert_eq!(harness.stop(), vec![1, 2, 3]);
    }

    #[test]
    fn factory_failure_is_reported_to_the_supervisor() {
        let factory: DetectorFactory = Box::new(|| Err(anyhow!("model file missing")));
        let (init_tx, init_rx) = crossbeam_channel::bounded(1);
        let handle = spawn_processing_worker(
            factory,
            ProcessingContext {
                input: Arc::new(LatestFrameSlot::new()),
                output: Arc::new(PublishedFrameSlot::new()),
                health: Arc::new(PipelineHealth::new()),
                shutdown: ShutdownSignal::new(),
                verbose: false,
            },
            init_tx,
        )
        .unwrap();
        let message = init_rx.recv().unwrap().unwrap_err();
        assert!(message.contains("model file missing"));
        handle.join().unwrap();
    }

    #[test]
    fn processed_frames_keep_capture_timestamp_and_size() {
        let mut detector = ml_core::NullDetector;
        let input = Frame::from_rgb_image(RgbImage::new(8, 6), 1234);
        let published = process_frame(&mut detector, input, 7, false).unwrap();
        assert_eq!(published.frame_number, 7);
        assert_eq!(published.frame.timestamp_ms, 1234);
        assert_eq!((published.frame.width, published.frame.height), (8, 6));
        assert!(published.detections.is_empty());
    }
}
