//! Event sink seam.
//!
//! The scheduling core hands every event to an [`EventSink`]. Sinks must not
//! block and must not fail the caller; delivery problems are the sink's
//! concern.

use std::sync::Mutex;

use crate::{EventKind, SchedEvent};

/// Destination for scheduler events.
pub trait EventSink: Send + Sync {
    /// Records an event. Fire-and-forget.
    fn record(&self, event: SchedEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn record(&self, _event: SchedEvent) {}
}

/// Sink that keeps events in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SchedEvent>>,
}

impl MemoryEventSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, oldest first.
    pub fn events(&self) -> Vec<SchedEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Recorded events of one kind.
    pub fn of_kind(&self, kind: EventKind) -> Vec<SchedEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        match self.events.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: SchedEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn record(&self, event: SchedEvent) {
        (**self).record(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchd_id::Iteration;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemoryEventSink::new();
        sink.record(SchedEvent::simple(
            EventKind::JobStarted,
            "a",
            "",
            1,
            Iteration::new(1),
        ));
        sink.record(SchedEvent::simple(
            EventKind::JobRejected,
            "b",
            "",
            2,
            Iteration::new(1),
        ));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].object_id, "a");
        assert_eq!(sink.of_kind(EventKind::JobRejected).len(), 1);
    }

    #[test]
    fn test_null_sink() {
        NullEventSink.record(SchedEvent::simple(
            EventKind::NodePurged,
            "n1",
            "",
            0,
            Iteration::default(),
        ));
    }
}
