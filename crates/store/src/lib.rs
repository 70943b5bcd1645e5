//! Counter store for banner rotation: per-(banner, slot, social group) arm
//! counters, slot display totals, and the banner↔slot assignment relation.
//!
//! Two backends implement the same traits: [`MemoryStore`] keeps everything
//! behind one lock, [`PostgresStore`] uses SQL transactions.

#![warn(clippy::unwrap_used)]

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use rotator_core::config::{StorageBackend, StorageConfig};
use rotator_core::types::{
    ArmSnapshot, Banner, BannerId, Slot, SlotId, SocialGroup, SocialGroupId,
};
use rotator_core::RotatorResult;
use std::sync::Arc;
use tracing::info;

/// Arm counters and the assignment relation that creates them.
///
/// Every method is atomic: it either applies completely or not at all, and
/// concurrent readers never observe a partial application.
#[async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &str;

    /// Every arm of the (slot, social group) context, ordered by banner id,
    /// with the slot's lifetime display count from the same snapshot.
    /// An unassigned slot yields an empty arm list; an unknown slot is `NotFound`.
    async fn get_arms(&self, slot: SlotId, group: SocialGroupId) -> RotatorResult<ArmSnapshot>;

    /// `click += 1` for the triple. `NotFound` when the row does not exist.
    async fn record_click(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<()>;

    /// `display += 1` for the triple together with the slot's (and banner's)
    /// lifetime display count. `NotFound` when the row does not exist.
    async fn record_display(
        &self,
        banner: BannerId,
        slot: SlotId,
        group: SocialGroupId,
    ) -> RotatorResult<()>;

    /// Insert the assignment and one zeroed arm per existing social group.
    /// Returns the number of arms created. `Conflict` on a duplicate pair,
    /// `NotFound` when the banner or slot does not exist.
    async fn add_assignment(&self, banner: BannerId, slot: SlotId) -> RotatorResult<u64>;

    /// Delete the assignment and all its arms. Returns the number of arms
    /// removed. `NotFound` when the pair is not assigned.
    async fn remove_assignment(&self, banner: BannerId, slot: SlotId) -> RotatorResult<u64>;
}

/// Banners, slots and social groups.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn create_banner(&self, description: &str) -> RotatorResult<Banner>;
    async fn create_slot(&self, description: &str) -> RotatorResult<Slot>;
    async fn create_social_group(&self, description: &str) -> RotatorResult<SocialGroup>;

    async fn banner(&self, id: BannerId) -> RotatorResult<Option<Banner>>;
    async fn slot(&self, id: SlotId) -> RotatorResult<Option<Slot>>;
    async fn social_group(&self, id: SocialGroupId) -> RotatorResult<Option<SocialGroup>>;
}

/// One backend seen through both store traits.
#[derive(Clone)]
pub struct StoreHandle {
    pub counters: Arc<dyn CounterStore>,
    pub catalog: Arc<dyn CatalogStore>,
}

impl StoreHandle {
    pub fn new<S>(store: S) -> Self
    where
        S: CounterStore + CatalogStore + 'static,
    {
        let store = Arc::new(store);
        Self {
            counters: store.clone(),
            catalog: store,
        }
    }
}

/// Open the backend named by `config.backend`.
pub async fn open(config: &StorageConfig) -> RotatorResult<StoreHandle> {
    let handle = match config.backend {
        StorageBackend::Memory => StoreHandle::new(MemoryStore::new()),
        StorageBackend::Postgres => StoreHandle::new(PostgresStore::connect(config).await?),
    };
    info!(backend = handle.counters.name(), "Counter store opened");
    Ok(handle)
}
