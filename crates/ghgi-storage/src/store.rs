use async_trait::async_trait;
use ghgi_core::{EmissionRecord, GpcReferenceNumber, InventoryTarget, PopulationSample};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("inventory {inventory_id} already has an emission record for {gpc_reference_number}")]
    DuplicateRecord {
        inventory_id: Uuid,
        gpc_reference_number: GpcReferenceNumber,
    },
    #[error("stored row is invalid: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    Replaced { previous_id: Uuid },
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn inventory_target(&self, inventory_id: Uuid)
        -> Result<Option<InventoryTarget>, StoreError>;
}

#[async_trait]
pub trait PopulationStore: Send + Sync {
    /// Samples for `city_id` with `from_year <= year <= to_year`, most recent first.
    async fn population_samples(
        &self,
        city_id: Uuid,
        from_year: i32,
        to_year: i32,
    ) -> Result<Vec<PopulationSample>, StoreError>;
}

#[async_trait]
pub trait EmissionsStore: Send + Sync {
    async fn find_emission_record(
        &self,
        inventory_id: Uuid,
        gpc_reference_number: GpcReferenceNumber,
    ) -> Result<Option<EmissionRecord>, StoreError>;

    /// Atomically insert `record`. An existing record for the same
    /// (inventory, reference number) fails with [`StoreError::DuplicateRecord`]
    /// unless `force_replace`, in which case it and its gas/activity children
    /// are deleted first.
    async fn write_emission_record(
        &self,
        record: &EmissionRecord,
        force_replace: bool,
    ) -> Result<WriteOutcome, StoreError>;

    /// Every record of the given inventories, ordered by inventory then reference number.
    async fn emission_records(
        &self,
        inventory_ids: &[Uuid],
    ) -> Result<Vec<EmissionRecord>, StoreError>;
}
