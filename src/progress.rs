//! Transfer progress notifications.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

/// Lifecycle stage reported by a [`ProgressEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEventType {
    /// Emitted once before the network call.
    Started,
    /// Emitted for every chunk of request body written.
    Data,
    /// Emitted once after a response was received.
    Completed,
    /// Emitted once when the request did not complete.
    Failed,
}

/// A single progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Bytes of request body sent so far.
    pub consumed_bytes: u64,
    /// Total request body size, 0 when unknown.
    pub total_bytes: u64,
    /// Bytes sent since the previous event.
    pub rw_bytes: u64,
    /// Lifecycle stage.
    pub event_type: ProgressEventType,
}

impl ProgressEvent {
    /// Builds an event.
    #[must_use]
    pub fn new(
        event_type: ProgressEventType,
        consumed_bytes: u64,
        total_bytes: u64,
        rw_bytes: u64,
    ) -> Self {
        Self {
            consumed_bytes,
            total_bytes,
            rw_bytes,
            event_type,
        }
    }
}

/// Observer of request progress, invoked synchronously on the request task.
pub trait ProgressListener: Send + Sync {
    /// Called for every lifecycle transition.
    fn progress_changed(&self, event: &ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn progress_changed(&self, event: &ProgressEvent) {
        self(event);
    }
}

/// Delivers `event` to `listener`, containing any panic it raises.
pub fn publish_progress(listener: Option<&dyn ProgressListener>, event: &ProgressEvent) {
    let Some(listener) = listener else {
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| listener.progress_changed(event))).is_err() {
        warn!(event = ?event.event_type, "progress listener panicked");
    }
}

/// Per-request progress state shared with the streaming body.
#[derive(Clone)]
pub(crate) struct ProgressTracker {
    listener: Option<Arc<dyn ProgressListener>>,
    consumed: Arc<AtomicU64>,
    total: u64,
}

impl ProgressTracker {
    pub(crate) fn new(listener: Option<Arc<dyn ProgressListener>>, total: u64) -> Self {
        Self {
            listener,
            consumed: Arc::new(AtomicU64::new(0)),
            total,
        }
    }

    pub(crate) fn publish(&self, event_type: ProgressEventType) {
        let event = ProgressEvent::new(event_type, self.consumed(), self.total, 0);
        publish_progress(self.listener.as_deref(), &event);
    }

    /// Records `n` bytes written and emits a data event.
    pub(crate) fn advance(&self, n: u64) {
        let consumed = self.consumed.fetch_add(n, Ordering::Relaxed) + n;
        let event = ProgressEvent::new(ProgressEventType::Data, consumed, self.total, n);
        publish_progress(self.listener.as_deref(), &event);
    }

    /// Restarts the byte count for a resent body.
    pub(crate) fn reset(&self) {
        self.consumed.store(0, Ordering::Relaxed);
    }

    pub(crate) fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressListener for Recorder {
        fn progress_changed(&self, event: &ProgressEvent) {
            self.0.lock().unwrap().push(*event);
        }
    }

    #[test]
    fn test_missing_listener_is_noop() {
        publish_progress(
            None,
            &ProgressEvent::new(ProgressEventType::Started, 0, 0, 0),
        );
    }

    #[test]
    fn test_closure_listener_receives_event() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let listener = move |event: &ProgressEvent| {
            counter.store(event.total_bytes, Ordering::SeqCst);
        };
        publish_progress(
            Some(&listener),
            &ProgressEvent::new(ProgressEventType::Started, 0, 42, 0),
        );
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    struct Panicky;

    impl ProgressListener for Panicky {
        fn progress_changed(&self, _event: &ProgressEvent) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let listener = Panicky;
        publish_progress(
            Some(&listener),
            &ProgressEvent::new(ProgressEventType::Completed, 1, 1, 0),
        );
    }

    #[test]
    fn test_tracker_accumulates_data_events() {
        let recorder = Arc::new(Recorder::default());
        let tracker = ProgressTracker::new(Some(recorder.clone()), 10);

        tracker.publish(ProgressEventType::Started);
        tracker.advance(4);
        tracker.advance(6);
        tracker.publish(ProgressEventType::Completed);

        let events = recorder.0.lock().unwrap().clone();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                ProgressEventType::Started,
                ProgressEventType::Data,
                ProgressEventType::Data,
                ProgressEventType::Completed,
            ]
        );
        assert_eq!(events[1].consumed_bytes, 4);
        assert_eq!(events[2].consumed_bytes, 10);
        assert_eq!(events[2].rw_bytes, 6);
        assert_eq!(events[3].consumed_bytes, 10);
        assert!(events.iter().all(|e| e.total_bytes == 10));
    }

    #[test]
    fn test_reset_restarts_count() {
        let tracker = ProgressTracker::new(None, 5);
        tracker.advance(5);
        tracker.reset();
        assert_eq!(tracker.consumed(), 0);
    }
}
