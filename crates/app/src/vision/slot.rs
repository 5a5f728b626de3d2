//! Single-slot hand-off buffers between pipeline stages.
//!
//! Both slots favour freshness over completeness: a write always replaces the
//! current occupant. Each slot owns its own lock, so capture writes never wait
//! on stream readers and vice versa.

use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use tokio::sync::watch;
use video_ingest::Frame;

use crate::vision::data::PublishedFrame;

/// Capacity-one buffer between capture and detection with destructive reads.
#[derive(Default)]
pub(crate) struct LatestFrameSlot {
    frame: Mutex<Option<Frame>>,
    ready: Condvar,
}

impl LatestFrameSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store `frame`, returning the unconsumed frame it displaced.
    pub(crate) fn put(&self, frame: Frame) -> Option<Frame> {
        let previous = self
            .frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(frame);
        self.ready.notify_one();
        previous
    }

    /// Remove and return the resident frame without blocking.
    pub(crate) fn take_if_present(&self) -> Option<Frame> {
        self.frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait up to `timeout` for a frame, then remove and return it.
    ///
    /// The lock is released while waiting, so producers are never starved.
    pub(crate) fn wait_take(&self, timeout: Duration) -> Option<Frame> {
        let guard = self.frame.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |frame| frame.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.take()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Latest annotated frame, readable by any number of stream clients.
///
/// Reads never drain the slot. Subscribers are woken on every publish.
pub(crate) struct PublishedFrameSlot {
    latest: watch::Sender<Option<Arc<PublishedFrame>>>,
}

impl Default for PublishedFrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishedFrameSlot {
    pub(crate) fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self { latest }
    }

    /// Replace the published frame and wake subscribers.
    pub(crate) fn publish(&self, frame: PublishedFrame) {
        self.latest.send_replace(Some(Arc::new(frame)));
    }

    /// Shared handle to the current frame, `None` until the first publish.
    pub(crate) fn peek(&self) -> Option<Arc<PublishedFrame>> {
        self.latest.borrow().clone()
    }

    /// Receiver that resolves whenever a new frame is published.
    ///
    /// The current value counts as already seen; read it with
    /// `borrow_and_update` before waiting on `changed`.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Arc<PublishedFrame>>> {
        self.latest.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        thread,
        time::{Duration, Instant},
    };

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

    fn published(id: u8) -> PublishedFrame {
        PublishedFrame::new(frame(id), Vec::new(), u64::from(id))
    }

    #[test]
    fn only_the_last_put_is_observable() {
        let slot = LatestFrameSlot::new();
        assert!(slot.put(frame(1)).is_none());
        assert_eq!(slot.put(frame(2)), Some(frame(1)));
        assert_eq!(slot.put(frame(3)), Some(frame(2)));
        assert_eq!(slot.take_if_present(), Some(frame(3)));
        assert_eq!(slot.take_if_present(), None);
    }

    #[test]
    fn take_after_put_returns_that_frame_and_empties_the_slot() {
        let slot = LatestFrameSlot::new();
        assert!(slot.is_empty());
        slot.put(frame(7));
        assert!(!slot.is_empty());
        assert_eq!(slot.take_if_present(), Some(frame(7)));
        assert!(slot.is_empty());
    }

    #[test]
    fn take_on_empty_slot_does_not_block() {
        let slot = LatestFrameSlot::new();
        let started = Instant::now();
        assert_eq!(slot.take_if_present(), None);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn wait_take_times_out_on_empty_slot() {
        let slot = LatestFrameSlot::new();
        assert_eq!(slot.wait_take(Duration::from_millis(10)), None);
    }

    #[test]
    fn wait_take_wakes_when_a_frame_arrives() {
        let slot = Arc::new(LatestFrameSlot::new());
        let consumer = {
            let slot = slot.clone();
            thread::spawn(move || slot.wait_take(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        slot.put(frame(4));
        assert_eq!(consumer.join().unwrap(), Some(frame(4)));
        assert!(slot.is_empty());
    }

    #[test]
    fn concurrent_puts_never_leave_more_than_one_frame() {
        let slot = Arc::new(LatestFrameSlot::new());
        let writers: Vec<_> = (0..4u8)
            .map(|writer| {
                let slot = slot.clone();
                thread::spawn(move || {
                    for i in 0..50u8 {
                        slot.put(frame(writer.wrapping_mul(50).wrapping_add(i)));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert!(slot.take_if_present().is_some());
        assert!(slot.take_if_present().is_none());
    }

    #[test]
    fn peek_is_empty_before_first_publish() {
        let slot = PublishedFrameSlot::new();
        assert!(slot.peek().is_none());
    }

    #[test]
    fn peek_does_not_consume() {
        let slot = PublishedFrameSlot::new();
        slot.publish(published(1));
        let first = slot.peek().unwrap();
        let second = slot.peek().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.frame, frame(1));
    }

    #[test]
    fn publish_overwrites_previous_frame() {
        let slot = PublishedFrameSlot::new();
        slot.publish(published(1));
        slot.publish(published(2));
        slot.publish(published(3));
        assert_eq!(slot.peek().unwrap().frame_number, 3);
    }

    #[test]
    fn subscribers_see_only_the_newest_frame() {
        let slot = PublishedFrameSlot::new();
        let mut updates = slot.subscribe();
        assert!(!updates.has_changed().unwrap());
        slot.publish(published(1));
        slot.publish(published(2));
        assert!(updates.has_changed().unwrap());
        let latest = updates.borrow_and_update().clone().unwrap();
        assert_eq!(latest.frame_number, 2);
        assert!(!updates.has_changed().unwrap());
    }
}
