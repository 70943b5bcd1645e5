//! Decision engine: `LoadArms -> (empty? NoEligibleBanners | Select) ->
//! RecordOutcome -> Return`.
//!
//! Loading and selecting never mutate the store. If recording the outcome
//! fails the selection is still reported, wrapped in
//! [`RotatorError::OutcomeNotRecorded`], and the caller decides whether to use
//! it.

use crate::deadline::within;
use rotator_core::config::EngineConfig;
use rotator_core::event_bus::{make_event, EventSink};
use rotator_core::types::{
    ArmSnapshot, BannerId, RotationEventType, SelectionOutcome, SlotId, SocialGroupId,
};
use rotator_core::{RotatorError, RotatorResult};
use rotator_store::CounterStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// How a banner was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// The context has exactly one eligible banner.
    SingleArm,
    /// An arm had never been displayed; untried arms play first, in banner order.
    WarmUp,
    /// Highest UCB1 score.
    Ucb1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub banner: BannerId,
    pub strategy: SelectionStrategy,
}

/// Pick a banner from a non-empty snapshot.
///
/// UCB1 is only defined once every arm has a trial and the slot has at least
/// two displays, so single-arm contexts and untried arms are resolved first.
pub fn select(snapshot: &ArmSnapshot) -> RotatorResult<Selection> {
    match snapshot.arms.as_slice() {
        [] => Err(RotatorError::InvalidInput(
            "cannot select from an empty arm set".to_string(),
        )),
        [only] => Ok(Selection {
            banner: only.id,
            strategy: SelectionStrategy::SingleArm,
        }),
        arms => {
            if let Some(untried) = arms.iter().find(|a| a.trials == 0) {
                return Ok(Selection {
                    banner: untried.id,
                    strategy: SelectionStrategy::WarmUp,
                });
            }
            let banner = rotator_rl_engine::choose(arms, snapshot.slot_total_display)?;
            Ok(Selection {
                banner,
                strategy: SelectionStrategy::Ucb1,
            })
        }
    }
}

pub struct DecisionEngine {
    store: Arc<dyn CounterStore>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<dyn CounterStore>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Choose the banner to show in `slot` to members of `group` and record
    /// the selection against its counters.
    pub async fn choose_banner(
        &self,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<BannerId> {
        self.choose(slot, group).await.map(|s| s.banner)
    }

    /// Like [`choose_banner`](Self::choose_banner) but also reports how the
    /// banner was picked.
    pub async fn choose(&self, slot: SlotId, group: SocialGroupId) -> RotatorResult<Selection> {
        slot.validate()?;
        group.validate()?;

        metrics::counter!("rotator.decisions").increment(1);
        let result = within(
            self.config.decision_timeout(),
            "choose_banner",
            self.decide(slot, group),
        )
        .await;

        if let Err(e) = &result {
            metrics::counter!("rotator.decision_errors").increment(1);
            debug!(slot = %slot, social_group = %group, error = %e, "Decision failed");
        }
        result
    }

    async fn decide(&self, slot: SlotId, group: SocialGroupId) -> RotatorResult<Selection> {
        let start = Instant::now();

        let snapshot = within(
            self.config.operation_timeout(),
            "get_arms",
            self.store.get_arms(slot, group),
        )
        .await?;

        if snapshot.is_empty() {
            metrics::counter!("rotator.no_eligible_banners").increment(1);
            return Err(RotatorError::NoEligibleBanners {
                slot: slot.0,
                social_group: group.0,
            });
        }

        let selection = select(&snapshot)?;
        if selection.strategy == SelectionStrategy::WarmUp {
            metrics::counter!("rotator.warm_up_plays").increment(1);
        }

        if let Err(e) = self.record_outcome(selection.banner, slot, group).await {
            warn!(
                banner = %selection.banner,
                slot = %slot,
                social_group = %group,
                error = %e,
                "Banner selected but outcome was not recorded"
            );
            return Err(RotatorError::OutcomeNotRecorded {
                banner: selection.banner,
                source: Box::new(e),
            });
        }

        self.events.emit(make_event(
            RotationEventType::BannerSelected,
            selection.banner,
            slot,
            Some(group),
        ));
        metrics::histogram!("rotator.decision_latency_us")
            .record(start.elapsed().as_micros() as f64);
        debug!(
            banner = %selection.banner,
            slot = %slot,
            social_group = %group,
            strategy = ?selection.strategy,
            arms = snapshot.arms.len(),
            global_trials = snapshot.slot_total_display,
            "Banner chosen"
        );

        Ok(selection)
    }

    async fn record_outcome(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<()> {
        match self.config.selection_outcome {
            SelectionOutcome::Display => self.write_display(banner, slot, group).await,
            SelectionOutcome::Click => self.write_click(banner, slot, group).await,
        }
    }

    /// Count a click on `banner` shown in `slot` to `group`.
    pub async fn record_click(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<()> {
        banner.validate()?;
        slot.validate()?;
        group.validate()?;
        self.write_click(banner, slot, group).await
    }

    /// Count an impression of `banner` in `slot` for `group`.
    pub async fn record_display(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<()> {
        banner.validate()?;
        slot.validate()?;
        group.validate()?;
        self.write_display(banner, slot, group).await
    }

    async fn write_click(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<()> {
        within(
            self.config.operation_timeout(),
            "record_click",
            self.store.record_click(banner, slot, group),
        )
        .await?;
        metrics::counter!("rotator.clicks").increment(1);
        self.events
            .emit(make_event(RotationEventType::Click, banner, slot, Some(group)));
        Ok(())
    }

    async fn write_display(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<()> {
        within(
            self.config.operation_timeout(),
            "record_display",
            self.store.record_display(banner, slot, group),
        )
        .await?;
        metrics::counter!("rotator.displays").increment(1);
        self.events
            .emit(make_event(RotationEventType::Display, banner, slot, Some(group)));
        Ok(())
    }
}
