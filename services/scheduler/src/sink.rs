//! Event sinks owned by the daemon.

use batchd_events::{EventEnvelope, EventKind, EventSink, SchedEvent};
use batchd_id::Iteration;
use serde::Serialize;
use tracing::{info, warn};

/// Writes every event to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: SchedEvent) {
        info!(
            event_id = %event.event_id,
            event_type = event.event_type(),
            object_type = %event.object_type,
            object_id = %event.object_id,
            iteration = %event.iteration,
            sched_time = event.sched_time,
            payload = %event.payload,
            "{}",
            event.detail
        );
    }
}

/// Records an event with a typed payload. A payload that fails to
/// serialize is logged and the event is recorded without it.
pub fn emit<P: Serialize>(
    sink: &dyn EventSink,
    kind: EventKind,
    object_id: &str,
    detail: impl Into<String>,
    payload: P,
    now: i64,
    iteration: Iteration,
) {
    let detail = detail.into();
    let built = EventEnvelope::builder()
        .object(kind, object_id)
        .detail(detail.clone())
        .sched_time(now)
        .iteration(iteration)
        .payload(payload)
        .build()
        .and_then(|e| e.into_json());
    match built {
        Ok(event) => sink.record(event),
        Err(e) => {
            warn!(kind = kind.as_str(), object_id = %object_id, error = %e, "event payload dropped");
            sink.record(SchedEvent::simple(kind, object_id, detail, now, iteration));
        }
    }
}
