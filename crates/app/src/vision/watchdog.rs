//! Stage heartbeats, pipeline counters and the watchdog thread that reports
//! stalled stages.
//!
//! Capture and detection are self-healing, so the watchdog does not restart
//! anything; it turns silence into log lines and a `degraded` health status.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tracing::{info, warn};

use crate::vision::{capture::ConnectionState, shutdown::ShutdownSignal, telemetry};

/// Sleep interval between watchdog health checks.
pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Time without a heartbeat before a stage is considered stalled.
pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 5_000;
/// Grace period at startup allowing stages to warm up before monitoring.
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 10_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HealthComponent {
    Capture,
    Detector,
}

impl HealthComponent {
    pub(crate) const ALL: [HealthComponent; 2] = [HealthComponent::Capture, HealthComponent::Detector];

    pub(crate) fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Detector => "detector",
        }
    }
}

/// Shared, lock-free view of pipeline liveness.
pub(crate) struct PipelineHealth {
    capture_beat: AtomicU64,
    detector_beat: AtomicU64,
    connection: AtomicU8,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    frames_captured: AtomicU64,
    frames_overwritten: AtomicU64,
    frames_processed: AtomicU64,
    detector_failures: AtomicU64,
    stream_clients: AtomicI64,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHealth {
    pub(crate) fn new() -> Self {
        let grace_deadline = current_millis().saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            capture_beat: AtomicU64::new(grace_deadline),
            detector_beat: AtomicU64::new(grace_deadline),
            connection: AtomicU8::new(ConnectionState::Disconnected as u8),
            connect_attempts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            frames_captured: AtomicU64::new(0),
            frames_overwritten: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            detector_failures: AtomicU64::new(0),
            stream_clients: AtomicI64::new(0),
        }
    }

    pub(crate) fn beat(&self, component: HealthComponent) {
        let now = current_millis();
        match component {
            HealthComponent::Capture => self.capture_beat.store(now, Ordering::Relaxed),
            HealthComponent::Detector => self.detector_beat.store(now, Ordering::Relaxed),
        }
    }

    fn last_beat(&self, component: HealthComponent) -> u64 {
        match component {
            HealthComponent::Capture => self.capture_beat.load(Ordering::Relaxed),
            HealthComponent::Detector => self.detector_beat.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn is_stale(&self, component: HealthComponent, now: u64) -> bool {
        now.saturating_sub(self.last_beat(component)) > WATCHDOG_STALE_THRESHOLD_MS
    }

    pub(crate) fn set_connection(&self, state: ConnectionState) {
        self.connection.store(state as u8, Ordering::Relaxed);
        metrics::gauge!("stream_camera_connection_state").set(f64::from(state as u8));
    }

    pub(crate) fn connection(&self) -> ConnectionState {
        ConnectionState::from_u8(self.connection.load(Ordering::Relaxed))
    }

    pub(crate) fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("stream_capture_connect_failures_total").increment(1);
    }

    pub(crate) fn record_captured(&self, overwrote_previous: bool) {
        self.beat(HealthComponent::Capture);
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("stream_capture_frames_total").increment(1);
        if overwrote_previous {
            self.frames_overwritten.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("stream_capture_overwritten_frames_total").increment(1);
        }
    }

    pub(crate) fn record_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("stream_detector_frames_total").increment(1);
    }

    pub(crate) fn record_detector_failure(&self) {
        self.detector_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("stream_detector_failures_total").increment(1);
    }

    pub(crate) fn client_connected(&self) {
        let clients = self.stream_clients.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("stream_clients").set(clients as f64);
    }

    pub(crate) fn client_disconnected(&self) {
        let clients = self.stream_clients.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!("stream_clients").set(clients as f64);
    }

    #[cfg(test)]
    pub(crate) fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn detector_failures(&self) -> u64 {
        self.detector_failures.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub(crate) fn stream_clients(&self) -> i64 {
        self.stream_clients.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> HealthSnapshot {
        let now = current_millis();
        let stale: Vec<&'static str> = HealthComponent::ALL
            .into_iter()
            .filter(|component| self.is_stale(*component, now))
            .map(HealthComponent::label)
            .collect();
        let connection = self.connection();
        let status = if stale.is_empty() && connection == ConnectionState::Reading {
            "ok"
        } else {
            "degraded"
        };
        HealthSnapshot {
            status,
            connection,
            stale_stages: stale,
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_overwritten: self.frames_overwritten.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            stream_clients: self.stream_clients.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthSnapshot {
    pub(crate) status: &'static str,
    pub(crate) connection: ConnectionState,
    pub(crate) stale_stages: Vec<&'static str>,
    pub(crate) connect_attempts: u64,
    pub(crate) connect_failures: u64,
    pub(crate) frames_captured: u64,
    pub(crate) frames_overwritten: u64,
    pub(crate) frames_processed: u64,
    pub(crate) detector_failures: u64,
    pub(crate) stream_clients: i64,
}

/// Spawn the watchdog thread that logs stage stalls and recoveries.
pub(crate) fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    shutdown: ShutdownSignal,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("stream-watchdog", move || {
        let mut stalled = [false; HealthComponent::ALL.len()];
        while !shutdown.wait_timeout(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS)) {
            let now = current_millis();
            for (idx, component) in HealthComponent::ALL.into_iter().enumerate() {
                let stale = health.is_stale(component, now);
                if stale && !stalled[idx] {
                    warn!(
                        stage = component.label(),
                        connection = health.connection().label(),
                        "Watchdog: no {} activity for over {} ms",
                        component.label(),
                        WATCHDOG_STALE_THRESHOLD_MS
                    );
                } else if !stale && stalled[idx] {
                    info!(stage = component.label(), "Watchdog: {} recovered", component.label());
                }
                stalled[idx] = stale;
                metrics::gauge!("stream_stage_stalled", "stage" => component.label())
                    .set(if stale { 1.0 } else { 0.0 });
            }
        }
    })
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_fresh_during_startup_grace() {
        let health = PipelineHealth::new();
        let now = current_millis();
        assert!(!health.is_stale(HealthComponent::Capture, now));
        assert!(!health.is_stale(HealthComponent::Detector, now));
    }

    #[test]
    fn missing_heartbeats_go_stale() {
        let health = PipelineHealth::new();
        health.beat(HealthComponent::Capture);
        let later = current_millis() + WATCHDOG_STALE_THRESHOLD_MS + 1;
        assert!(health.is_stale(HealthComponent::Capture, later));
    }

    #[test]
    fn snapshot_reports_degraded_until_reading() {
        let health = PipelineHealth::new();
        let snapshot = health.snapshot();
        assert_eq!(snapshot.status, "degraded");
        assert_eq!(snapshot.connection, ConnectionState::Disconnected);

        health.set_connection(ConnectionState::Reading);
        health.record_captured(false);
        health.record_captured(true);
        let snapshot = health.snapshot();
        assert_eq!(snapshot.status, "ok");
        assert_eq!(snapshot.frames_captured, 2);
        assert_eq!(snapshot.frames_overwritten, 1);
    }

    #[test]
    fn client_count_tracks_connects_and_disconnects() {
        let health = PipelineHealth::new();
        health.client_connected();
        health.client_connected();
        health.client_disconnected();
        assert_eq!(health.stream_clients(), 1);
    }

    #[test]
    fn watchdog_exits_on_shutdown() {
        let shutdown = ShutdownSignal::new();
        let handle = spawn_watchdog(Arc::new(PipelineHealth::new()), shutdown.clone()).unwrap();
        shutdown.trigger();
        handle.join().unwrap();
    }
}
