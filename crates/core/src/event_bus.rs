//! Rotation event bus: trait for emitting selection, counter and assignment
//! events from the decision engine and assignment manager.
//!
//! Components accept an `Arc<dyn EventSink>`; the binary wires a
//! [`TracingSink`], tests use a [`CaptureSink`].

use crate::types::{BannerId, RotationEvent, RotationEventType, SlotId, SocialGroupId};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: RotationEvent);
}

/// No-op sink for callers that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: RotationEvent) {}
}

/// Writes every event as a structured log line under the `rotation_events` target.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: RotationEvent) {
        info!(
            target: "rotation_events",
            event_id = %event.event_id,
            event_type = ?event.event_type,
            banner = %event.banner_id,
            slot = %event.slot_id,
            social_group = ?event.social_group_id.map(|g| g.0),
            "rotation event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<RotationEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<RotationEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: RotationEventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: RotationEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

pub fn make_event(
    event_type: RotationEventType,
    banner_id: BannerId,
    slot_id: SlotId,
    social_group_id: Option<SocialGroupId>,
) -> RotationEvent {
    RotationEvent {
        event_id: Uuid::new_v4(),
        event_type,
        banner_id,
        slot_id,
        social_group_id,
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
