//! Typed agent events and the broadcast bus
//!
//! The agent subscribes to the transform-scoped events and publishes
//! processing/request events for the downstream agents. Delivery is
//! best-effort and at-least-once from the publisher's perspective;
//! consumers must be idempotent.

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    NewTransform { transform_id: i64 },
    UpdateTransform { transform_id: i64 },
    AbortTransform { transform_id: i64 },
    ResumeTransform { transform_id: i64 },
    NewProcessing { processing_id: i64 },
    UpdateProcessing { processing_id: i64 },
    AbortProcessing { processing_id: i64 },
    ResumeProcessing { processing_id: i64 },
    UpdateRequest { request_id: i64 },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NewTransform { .. } => EventKind::NewTransform,
            Event::UpdateTransform { .. } => EventKind::UpdateTransform,
            Event::AbortTransform { .. } => EventKind::AbortTransform,
            Event::ResumeTransform { .. } => EventKind::ResumeTransform,
            Event::NewProcessing { .. } => EventKind::NewProcessing,
            Event::UpdateProcessing { .. } => EventKind::UpdateProcessing,
            Event::AbortProcessing { .. } => EventKind::AbortProcessing,
            Event::ResumeProcessing { .. } => EventKind::ResumeProcessing,
            Event::UpdateRequest { .. } => EventKind::UpdateRequest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewTransform,
    UpdateTransform,
    AbortTransform,
    ResumeTransform,
    NewProcessing,
    UpdateProcessing,
    AbortProcessing,
    ResumeProcessing,
    UpdateRequest,
}

/// Publish/subscribe fan-out over a broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. A bus with no subscribers drops it silently.
    pub fn publish(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::debug!(?event, "no subscribers for event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
