//! Camera capture loop with reconnect and capped exponential backoff.
//!
//! The loop never gives up on the source. Every open failure waits out the
//! next backoff delay, every read failure tears the session down and opens a
//! fresh one, and the newest frame always replaces whatever the detector has
//! not consumed yet.

use std::{io, sync::Arc, thread, time::Duration};

use serde::Serialize;
use tracing::{debug, info, warn};
use video_ingest::{CaptureError, FrameReader, VideoSource};

use crate::vision::{
    shutdown::ShutdownSignal,
    slot::LatestFrameSlot,
    telemetry,
    watchdog::PipelineHealth,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub(crate) enum ConnectionState {
    Disconnected = 0,
    Connected = 1,
    Reading = 2,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Reading,
            _ => ConnectionState::Disconnected,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Reading => "reading",
        }
    }
}

/// Delay schedule between failed connection attempts.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RetryPolicy {
    pub(crate) initial: Duration,
    pub(crate) max: Duration,
    /// Growth factor applied after each failure; `1.0` keeps the delay constant.
    pub(crate) multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    #[cfg(test)]
    pub(crate) fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
        }
    }
}

/// Running state of a [`RetryPolicy`].
pub(crate) struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        let current = policy.initial.min(policy.max);
        Self { policy, current }
    }

    /// Delay to wait now; advances the schedule for the next failure.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.as_secs_f64() * self.policy.multiplier.max(1.0);
        self.current = Duration::try_from_secs_f64(grown)
            .unwrap_or(self.policy.max)
            .min(self.policy.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.policy.initial.min(self.policy.max);
    }
}

/// How a connected session ended.
enum SessionEnd {
    Shutdown,
    ReadFailed { frames: u64, error: CaptureError },
}

/// Keep `slot` filled with the newest frame from `source` until shutdown.
pub(crate) fn run_capture_loop(
    source: &dyn VideoSource,
    slot: &LatestFrameSlot,
    health: &PipelineHealth,
    policy: RetryPolicy,
    shutdown: &ShutdownSignal,
) {
    let mut backoff = Backoff::new(policy);
    let mut attempt: u64 = 0;

    while !shutdown.is_triggered() {
        attempt += 1;
        health.set_connection(ConnectionState::Disconnected);
        health.record_connect_attempt();
        metrics::counter!("stream_capture_connect_attempts_total").increment(1);

        let reader = match source.open() {
            Ok(reader) => reader,
            Err(err) => {
                health.record_connect_failure();
                let delay = backoff.next_delay();
                warn!(
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "Camera connection failed: {err}"
                );
                if shutdown.wait_timeout(delay) {
                    break;
                }
                continue;
            }
        };

        health.set_connection(ConnectionState::Connected);
        info!(attempt, source = source.describe(), "Camera connected");

        let session_span = tracing::info_span!("capture.session", attempt);
        match session_span.in_scope(|| read_session(reader, slot, health, shutdown, &mut backoff)) {
            SessionEnd::Shutdown => break,
            SessionEnd::ReadFailed { frames, error } => {
                health.set_connection(ConnectionState::Disconnected);
                if frames > 0 {
                    warn!(frames, "Camera read failed, reconnecting: {error}");
                    continue;
                }
                let delay = backoff.next_delay();
                warn!(
                    retry_in_ms = delay.as_millis() as u64,
                    "Camera produced no frames before failing: {error}"
                );
                if shutdown.wait_timeout(delay) {
                    break;
                }
            }
        }
    }

    health.set_connection(ConnectionState::Disconnected);
    debug!("Capture loop stopped");
}

fn read_session(
    mut reader: Box<dyn FrameReader>,
    slot: &LatestFrameSlot,
    health: &PipelineHealth,
    shutdown: &ShutdownSignal,
    backoff: &mut Backoff,
) -> SessionEnd {
    let mut frames: u64 = 0;
    loop {
        if shutdown.is_triggered() {
            return SessionEnd::Shutdown;
        }
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            // The reader is dropped on return, releasing the connection.
            Err(error) => return SessionEnd::ReadFailed { frames, error },
        };
        if frames == 0 {
            backoff.reset();
            health.set_connection(ConnectionState::Reading);
            debug!(
                width = frame.width,
                height = frame.height,
                "First frame received"
            );
        }
        frames += 1;
        let displaced = slot.put(frame);
        health.record_captured(displaced.is_some());
    }
}

/// Spawn the capture thread.
pub(crate) fn spawn_capture_worker(
    source: Arc<dyn VideoSource>,
    slot: Arc<LatestFrameSlot>,
    health: Arc<PipelineHealth>,
    policy: RetryPolicy,
    shutdown: ShutdownSignal,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("stream-capture", move || {
        run_capture_loop(source.as_ref(), &slot, &health, policy, &shutdown);
    })
}
