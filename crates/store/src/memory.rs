//! In-process store. The whole data set lives behind a single `RwLock`, so
//! every operation is one critical section: multi-row updates are atomic and
//! readers see either none or all of a write.

use crate::{CatalogStore, CounterStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use rotator_core::types::{
    Arm, ArmSnapshot, Banner, BannerId, Slot, SlotId, SocialGroup, SocialGroupId,
};
use rotator_core::{RotatorError, RotatorResult};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    display: u64,
    click: u64,
}

#[derive(Default)]
struct State {
    banners: BTreeMap<BannerId, Banner>,
    slots: BTreeMap<SlotId, Slot>,
    groups: BTreeMap<SocialGroupId, SocialGroup>,
    assignments: BTreeSet<(BannerId, SlotId)>,
    // Keyed slot-first so one context is a contiguous range.
    statistics: BTreeMap<(SlotId, SocialGroupId, BannerId), Counters>,
    last_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Number of arm rows across all contexts.
    pub fn statistics_len(&self) -> usize {
        self.state.read().statistics.len()
    }

    pub fn is_assigned(&self, banner: BannerId, slot: SlotId) -> bool {
        self.state.read().assignments.contains(&(banner, slot))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn missing_arm(banner: BannerId, slot: SlotId, group: SocialGroupId) -> RotatorError {
    RotatorError::NotFound(format!(
        "no statistics for banner {banner} in slot {slot} for social group {group}"
    ))
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_arms(&self, slot: SlotId, group: SocialGroupId) -> RotatorResult<ArmSnapshot> {
        let state = self.state.read();
        let slot_row = state
            .slots
            .get(&slot)
            .ok_or_else(|| RotatorError::NotFound(format!("slot {slot}")))?;

        let arms = state
            .statistics
            .range((slot, group, BannerId::MIN)..=(slot, group, BannerId::MAX))
            .map(|(&(_, _, banner), c)| Arm::new(banner, c.display, c.click))
            .collect();

        Ok(ArmSnapshot {
            arms,
            slot_total_display: slot_row.total_display,
        })
    }

    async fn record_click(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<()> {
        let mut state = self.state.write();
        let counters = state
            .statistics
            .get_mut(&(slot, group, banner))
            .ok_or_else(|| missing_arm(banner, slot, group))?;
        counters.click += 1;
        Ok(())
    }

    async fn record_display(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<()> {
        let mut state = self.state.write();
        let state = &mut *state;

        // Check every row before touching any of them.
        if !state.statistics.contains_key(&(slot, group, banner)) {
            return Err(missing_arm(banner, slot, group));
        }
        let slot_row = state
            .slots
            .get_mut(&slot)
            .ok_or_else(|| RotatorError::NotFound(format!("slot {slot}")))?;

        slot_row.total_display += 1;
        if let Some(counters) = state.statistics.get_mut(&(slot, group, banner)) {
            counters.display += 1;
        }
        if let Some(banner_row) = state.banners.get_mut(&banner) {
            banner_row.total_display += 1;
        }
        Ok(())
    }

    async fn add_assignment(&self, banner: BannerId, slot: SlotId) -> RotatorResult<u64> {
        let mut state = self.state.write();

        if !state.banners.contains_key(&banner) {
            return Err(RotatorError::NotFound(format!("banner {banner}")));
        }
        if !state.slots.contains_key(&slot) {
            return Err(RotatorError::NotFound(format!("slot {slot}")));
        }
        if !state.assignments.insert((banner, slot)) {
            return Err(RotatorError::Conflict(format!(
                "banner {banner} is already assigned to slot {slot}"
            )));
        }

        let groups: Vec<SocialGroupId> = state.groups.keys().copied().collect();
        for group in &groups {
            state
                .statistics
                .insert((slot, *group, banner), Counters::default());
        }

        debug!(banner = %banner, slot = %slot, arms = groups.len(), "Assignment stored");
        Ok(groups.len() as u64)
    }

    async fn remove_assignment(&self, banner: BannerId, slot: SlotId) -> RotatorResult<u64> {
        let mut state = self.state.write();

        if !state.assignments.remove(&(banner, slot)) {
            return Err(RotatorError::NotFound(format!(
                "banner {banner} is not assigned to slot {slot}"
            )));
        }

        let before = state.statistics.len();
        state
            .statistics
            .retain(|&(s, _, b), _| !(s == slot && b == banner));
        let removed = (before - state.statistics.len()) as u64;

        debug!(banner = %banner, slot = %slot, arms = removed, "Assignment deleted");
        Ok(removed)
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn create_banner(&self, description: &str) -> RotatorResult<Banner> {
        let mut state = self.state.write();
        let banner = Banner {
            id: BannerId(state.next_id()),
            description: description.to_string(),
            total_display: 0,
        };
        state.banners.insert(banner.id, banner.clone());
        Ok(banner)
    }

    async fn create_slot(&self, description: &str) -> RotatorResult<Slot> {
        let mut state = self.state.write();
        let slot = Slot {
            id: SlotId(state.next_id()),
            description: description.to_string(),
            total_display: 0,
        };
        state.slots.insert(slot.id, slot.clone());
        Ok(slot)
    }

    /// Existing assignments are not back-filled with arms for the new group.
    async fn create_social_group(&self, description: &str) -> RotatorResult<SocialGroup> {
        let mut state = self.state.write();
        let group = SocialGroup {
            id: SocialGroupId(state.next_id()),
            description: description.to_string(),
        };
        state.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn banner(&self, id: BannerId) -> RotatorResult<Option<Banner>> {
        Ok(self.state.read().banners.get(&id).cloned())
    }

    async fn slot(&self, id: SlotId) -> RotatorResult<Option<Slot>> {
        Ok(self.state.read().slots.get(&id).cloned())
    }

    async fn social_group(&self, id: SocialGroupId) -> RotatorResult<Option<SocialGroup>> {
        Ok(self.state.read().groups.get(&id).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rotator_core::ErrorKind;
    use std::sync::Arc;

    struct Fixture {
        store: Arc<MemoryStore>,
        banners: Vec<BannerId>,
        slot: SlotId,
        groups: Vec<SocialGroupId>,
    }

    async fn fixture(banners: usize, groups: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut banner_ids = Vec::new();
        for i in 0..banners {
            banner_ids.push(store.create_banner(&format!("banner-{i}")).await.unwrap().id);
        }
        let slot = store.create_slot("top").await.unwrap().id;
        let mut group_ids = Vec::new();
        for i in 0..groups {
            group_ids.push(store.create_social_group(&format!("group-{i}")).await.unwrap().id);
        }
        Fixture {
            store,
            banners: banner_ids,
            slot,
            groups: group_ids,
        }
    }

    #[tokio::test]
    async fn test_add_assignment_creates_zeroed_arm_per_group() {
        let f = fixture(1, 3).await;
        let created = f.store.add_assignment(f.banners[0], f.slot).await.unwrap();
        assert_eq!(created, 3);

        for group in &f.groups {
            let snapshot = f.store.get_arms(f.slot, *group).await.unwrap();
            assert_eq!(snapshot.arms, vec![Arm::untried(f.banners[0])]);
            assert_eq!(snapshot.slot_total_display, 0);
        }
    }

    #[tokio::test]
    async fn test_duplicate_assignment_conflicts() {
        let f = fixture(1, 2).await;
        f.store.add_assignment(f.banners[0], f.slot).await.unwrap();
        let err = f.store.add_assignment(f.banners[0], f.slot).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(f.store.statistics_len(), 2);
    }

    #[tokio::test]
    async fn test_assignment_requires_known_banner_and_slot() {
        let f = fixture(1, 1).await;
        let err = f.store.add_assignment(BannerId(999), f.slot).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = f.store.add_assignment(f.banners[0], SlotId(999)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(f.store.statistics_len(), 0);
    }

    #[tokio::test]
    async fn test_remove_assignment_deletes_arms() {
        let f = fixture(2, 2).await;
        f.store.add_assignment(f.banners[0], f.slot).await.unwrap();
        f.store.add_assignment(f.banners[1], f.slot).await.unwrap();

        let removed = f.store.remove_assignment(f.banners[0], f.slot).await.unwrap();
        assert_eq!(removed, 2);
        assert!(!f.store.is_assigned(f.banners[0], f.slot));

        for group in &f.groups {
            let snapshot = f.store.get_arms(f.slot, *group).await.unwrap();
            assert!(snapshot.arm(f.banners[0]).is_none());
            assert!(snapshot.arm(f.banners[1]).is_some());
        }
    }

    #[tokio::test]
    async fn test_remove_unassigned_pair_is_not_found() {
        let f = fixture(1, 1).await;
        let err = f.store.remove_assignment(f.banners[0], f.slot).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unassigned_slot_has_no_arms() {
        let f = fixture(1, 1).await;
        let snapshot = f.store.get_arms(f.slot, f.groups[0]).await.unwrap();
        assert!(snapshot.is_empty());

        let err = f.store.get_arms(SlotId(999), f.groups[0]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_new_group_is_not_backfilled() {
        let f = fixture(1, 1).await;
        f.store.add_assignment(f.banners[0], f.slot).await.unwrap();
        let late = f.store.create_social_group("late").await.unwrap().id;

        let snapshot = f.store.get_arms(f.slot, late).await.unwrap();
        assert!(snapshot.is_empty());
        let err = f
            .store
            .record_display(f.banners[0], f.slot, late)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_click_on_missing_arm_is_not_found() {
        let f = fixture(1, 1).await;
        let err = f
            .store
            .record_click(f.banners[0], f.slot, f.groups[0])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_display_updates_arm_slot_and_banner_totals() {
        let f = fixture(1, 2).await;
        f.store.add_assignment(f.banners[0], f.slot).await.unwrap();

        f.store.record_display(f.banners[0], f.slot, f.groups[0]).await.unwrap();
        f.store.record_display(f.banners[0], f.slot, f.groups[1]).await.unwrap();
        f.store.record_click(f.banners[0], f.slot, f.groups[1]).await.unwrap();

        let first = f.store.get_arms(f.slot, f.groups[0]).await.unwrap();
        assert_eq!(first.arms, vec![Arm::new(f.banners[0], 1, 0)]);
        assert_eq!(first.slot_total_display, 2);

        let second = f.store.get_arms(f.slot, f.groups[1]).await.unwrap();
        assert_eq!(second.arms, vec![Arm::new(f.banners[0], 1, 1)]);

        let banner = f.store.banner(f.banners[0]).await.unwrap().unwrap();
        assert_eq!(banner.total_display, 2);
    }

    #[tokio::test]
    async fn test_failed_display_leaves_slot_total_untouched() {
        let f = fixture(1, 1).await;
        let err = f
            .store
            .record_display(f.banners[0], f.slot, f.groups[0])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let slot = f.store.slot(f.slot).await.unwrap().unwrap();
        assert_eq!(slot.total_display, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_displays_are_not_lost() {
        let f = fixture(1, 1).await;
        let (banner, slot, group) = (f.banners[0], f.slot, f.groups[0]);
        f.store.add_assignment(banner, slot).await.unwrap();

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let store = f.store.clone();
                tokio::spawn(async move { store.record_display(banner, slot, group).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let snapshot = f.store.get_arms(slot, group).await.unwrap();
        assert_eq!(snapshot.arms[0].trials, 100);
        assert_eq!(snapshot.slot_total_display, 100);
    }

    #[tokio::test]
    async fn test_arms_ordered_by_banner_id() {
        let f = fixture(3, 1).await;
        for banner in f.banners.iter().rev() {
            f.store.add_assignment(*banner, f.slot).await.unwrap();
        }
        let snapshot = f.store.get_arms(f.slot, f.groups[0]).await.unwrap();
        let ids: Vec<BannerId> = snapshot.arms.iter().map(|a| a.id).collect();
        assert_eq!(ids, f.banners);
    }

    #[tokio::test]
    async fn test_catalog_lookups() {
        let f = fixture(1, 1).await;
        assert_eq!(
            f.store.banner(f.banners[0]).await.unwrap().unwrap().description,
            "banner-0"
        );
        assert_eq!(f.store.slot(f.slot).await.unwrap().unwrap().description, "top");
        assert!(f.store.social_group(f.groups[0]).await.unwrap().is_some());
        assert!(f.store.social_group(SocialGroupId(404)).await.unwrap().is_none());
    }
}
