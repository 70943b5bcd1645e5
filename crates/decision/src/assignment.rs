//! Banner↔slot eligibility. Adding an assignment creates one zeroed arm per
//! social group; removing it deletes every arm of the pair. Both are single
//! atomic store operations.

use crate::deadline::within;
use rotator_core::config::EngineConfig;
use rotator_core::event_bus::{make_event, EventSink};
use rotator_core::types::{BannerId, RotationEventType, SlotId};
use rotator_core::RotatorResult;
use rotator_store::CounterStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct AssignmentManager {
    store: Arc<dyn CounterStore>,
    events: Arc<dyn EventSink>,
    operation_timeout: Duration,
}

impl AssignmentManager {
    pub fn new(
        store: Arc<dyn CounterStore>,
        events: Arc<dyn EventSink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            events,
            operation_timeout: config.operation_timeout(),
        }
    }

    /// Make `banner` eligible for `slot`. Returns the number of arms created.
    pub async fn add_assignment(&self, banner: BannerId, slot: SlotId) -> RotatorResult<u64> {
        banner.validate()?;
        slot.validate()?;

        let arms = within(
            self.operation_timeout,
            "add_assignment",
            self.store.add_assignment(banner, slot),
        )
        .await?;

        metrics::counter!("rotator.assignments_added").increment(1);
        self.events.emit(make_event(
            RotationEventType::AssignmentAdded,
            banner,
            slot,
            None,
        ));
        info!(banner = %banner, slot = %slot, arms, "Banner assigned to slot");
        Ok(arms)
    }

    /// Withdraw `banner` from `slot`. Returns the number of arms removed.
    pub async fn remove_assignment(&self, banner: BannerId, slot: SlotId) -> RotatorResult<u64> {
        banner.validate()?;
        slot.validate()?;

        let arms = within(
            self.operation_timeout,
            "remove_assignment",
            self.store.remove_assignment(banner, slot),
        )
        .await?;

        metrics::counter!("rotator.assignments_removed").increment(1);
        self.events.emit(make_event(
            RotationEventType::AssignmentRemoved,
            banner,
            slot,
            None,
        ));
        info!(banner = %banner, slot = %slot, arms, "Banner removed from slot");
        Ok(arms)
    }
}
