//! Event envelope - the common wrapper for all scheduler events.

use batchd_id::{EventId, Iteration};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EventError, EventKind, ObjectType};

/// Actor that caused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// The scheduling core.
    #[default]
    Scheduler,
    /// The resource manager reported the change.
    ResourceManager,
    /// An administrator acted on the object.
    Admin,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::Scheduler => write!(f, "scheduler"),
            ActorType::ResourceManager => write!(f, "resource_manager"),
            ActorType::Admin => write!(f, "admin"),
        }
    }
}

/// The event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    /// Unique, time-ordered event identifier.
    pub event_id: EventId,

    /// Wall-clock time the event was recorded.
    pub occurred_at: DateTime<Utc>,

    /// Scheduler clock (epoch seconds) at the time of the event.
    pub sched_time: i64,

    /// Scheduling iteration that produced the event.
    pub iteration: Iteration,

    /// Type of object the event is about.
    pub object_type: ObjectType,

    /// Name of the object (job name, node name, reservation name).
    pub object_id: String,

    /// Event kind.
    pub kind: EventKind,

    /// Who caused the event.
    pub actor: ActorType,

    /// Operator-readable detail line.
    pub detail: String,

    /// Kind-specific payload.
    pub payload: P,
}

/// Event envelope with an untyped JSON payload, as handed to sinks.
pub type SchedEvent = EventEnvelope<serde_json::Value>;

impl<P> EventEnvelope<P> {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder<P> {
        EventEnvelopeBuilder::new()
    }

    /// The dotted event type string.
    pub fn event_type(&self) -> &'static str {
        self.kind.as_str()
    }
}

impl<P: Serialize> EventEnvelope<P> {
    /// Erases the payload type into JSON.
    pub fn into_json(self) -> Result<SchedEvent, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id,
            occurred_at: self.occurred_at,
            sched_time: self.sched_time,
            iteration: self.iteration,
            object_type: self.object_type,
            object_id: self.object_id,
            kind: self.kind,
            actor: self.actor,
            detail: self.detail,
            payload: serde_json::to_value(self.payload)?,
        })
    }
}

impl SchedEvent {
    /// Shorthand for an event without a structured payload.
    pub fn simple(
        kind: EventKind,
        object_id: impl Into<String>,
        detail: impl Into<String>,
        sched_time: i64,
        iteration: Iteration,
    ) -> Self {
        EventEnvelope {
            event_id: EventId::new(),
            occurred_at: Utc::now(),
            sched_time,
            iteration,
            object_type: kind.object_type(),
            object_id: object_id.into(),
            kind,
            actor: ActorType::Scheduler,
            detail: detail.into(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder<P> {
    event_id: Option<EventId>,
    occurred_at: Option<DateTime<Utc>>,
    sched_time: Option<i64>,
    iteration: Iteration,
    object_id: Option<String>,
    kind: Option<EventKind>,
    actor: ActorType,
    detail: String,
    payload: Option<P>,
}

impl<P> EventEnvelopeBuilder<P> {
    pub fn new() -> Self {
        Self {
            event_id: None,
            occurred_at: None,
            sched_time: None,
            iteration: Iteration::default(),
            object_id: None,
            kind: None,
            actor: ActorType::Scheduler,
            detail: String::new(),
            payload: None,
        }
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn sched_time(mut self, now: i64) -> Self {
        self.sched_time = Some(now);
        self
    }

    pub fn iteration(mut self, iteration: Iteration) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn object(mut self, kind: EventKind, object_id: impl Into<String>) -> Self {
        self.kind = Some(kind);
        self.object_id = Some(object_id.into());
        self
    }

    pub fn actor(mut self, actor: ActorType) -> Self {
        self.actor = actor;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event envelope.
    ///
    /// The event id and wall-clock time default to fresh values; every other
    /// unset required field is an error.
    pub fn build(self) -> Result<EventEnvelope<P>, EventError> {
        let kind = self.kind.ok_or(EventError::MissingField("kind"))?;
        Ok(EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            sched_time: self.sched_time.ok_or(EventError::MissingField("sched_time"))?,
            iteration: self.iteration,
            object_type: kind.object_type(),
            object_id: self.object_id.ok_or(EventError::MissingField("object_id"))?,
            kind,
            actor: self.actor,
            detail: self.detail,
            payload: self.payload.ok_or(EventError::MissingField("payload"))?,
        })
    }
}

impl<P> Default for EventEnvelopeBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}
