use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ghgi_core::{EmissionRecord, GpcReferenceNumber, InventoryTarget, PopulationSample};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{EmissionsStore, InventoryStore, PopulationStore, StoreError, WriteOutcome};

#[derive(Debug, Default)]
struct MemoryState {
    inventories: HashMap<Uuid, InventoryTarget>,
    population: Vec<PopulationSample>,
    records: BTreeMap<(Uuid, GpcReferenceNumber), EmissionRecord>,
}

/// Process-local store. One mutex guards all state, so check-delete-insert
/// in [`EmissionsStore::write_emission_record`] cannot interleave.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    population_queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_inventory(&self, target: InventoryTarget) {
        self.state
            .lock()
            .await
            .inventories
            .insert(target.inventory_id, target);
    }

    pub async fn insert_population(&self, sample: PopulationSample) {
        let mut state = self.state.lock().await;
        state
            .population
            .retain(|s| !(s.city_id == sample.city_id && s.year == sample.year));
        state.population.push(sample);
    }

    pub fn population_query_count(&self) -> usize {
        self.population_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn inventory_target(
        &self,
        inventory_id: Uuid,
    ) -> Result<Option<InventoryTarget>, StoreError> {
        Ok(self.state.lock().await.inventories.get(&inventory_id).cloned())
    }
}

#[async_trait]
impl PopulationStore for MemoryStore {
    async fn population_samples(
        &self,
        city_id: Uuid,
        from_year: i32,
        to_year: i32,
    ) -> Result<Vec<PopulationSample>, StoreError> {
        self.population_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        let mut samples: Vec<PopulationSample> = state
            .population
            .iter()
            .filter(|s| s.city_id == city_id && (from_year..=to_year).contains(&s.year))
            .copied()
            .collect();
        samples.sort_by(|a, b| b.year.cmp(&a.year));
        Ok(samples)
    }
}

#[async_trait]
impl EmissionsStore for MemoryStore {
    async fn find_emission_record(
        &self,
        inventory_id: Uuid,
        gpc_reference_number: GpcReferenceNumber,
    ) -> Result<Option<EmissionRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .get(&(inventory_id, gpc_reference_number))
            .cloned())
    }

    async fn write_emission_record(
        &self,
        record: &EmissionRecord,
        force_replace: bool,
    ) -> Result<WriteOutcome, StoreError> {
        let key = (record.inventory_id, record.gpc_reference_number);
        let mut state = self.state.lock().await;

        let outcome = match state.records.get(&key) {
            Some(_) if !force_replace => {
                return Err(StoreError::DuplicateRecord {
                    inventory_id: record.inventory_id,
                    gpc_reference_number: record.gpc_reference_number,
                })
            }
            Some(existing) => WriteOutcome::Replaced {
                previous_id: existing.id,
            },
            None => WriteOutcome::Inserted,
        };
        // Gas and activity children live inside the record, so removal cascades.
        state.records.remove(&key);
        state.records.insert(key, record.clone());
        Ok(outcome)
    }

    async fn emission_records(
        &self,
        inventory_ids: &[Uuid],
    ) -> Result<Vec<EmissionRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|((inventory_id, _), _)| inventory_ids.contains(inventory_id))
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ghgi_core::{Gas, GasAmount, DEFAULT_GWP_HORIZON_YEARS};

    fn record(inventory_id: Uuid, gpc: &str, co2eq_kg: i64) -> EmissionRecord {
        EmissionRecord {
            id: Uuid::new_v4(),
            inventory_id,
            gpc_reference_number: gpc.parse().unwrap(),
            co2eq_kg: Some(co2eq_kg),
            co2eq_years: DEFAULT_GWP_HORIZON_YEARS,
            co2eq_20yr_kg: None,
            data_quality: None,
            datasource_id: Some("test".into()),
            unavailable_reason: None,
            unavailable_explanation: None,
            gases: Gas::ALL
                .into_iter()
                .map(|gas| GasAmount { gas, amount_kg: 0 })
                .collect(),
            activities: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_write_without_force_leaves_existing_record() {
        let store = MemoryStore::new();
        let inventory_id = Uuid::new_v4();
        let first = record(inventory_id, "I.1.1", 10);
        store.write_emission_record(&first, false).await.unwrap();

        let second = record(inventory_id, "I.1.1", 20);
        let err = store.write_emission_record(&second, false).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRecord { .. }));

        let kept = store
            .find_emission_record(inventory_id, "I.1.1".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept, first);
    }

    #[tokio::test]
    async fn forced_write_replaces_and_reports_previous_id() {
        let store = MemoryStore::new();
        let inventory_id = Uuid::new_v4();
        let first = record(inventory_id, "I.1.1", 10);
        store.write_emission_record(&first, false).await.unwrap();

        let second = record(inventory_id, "I.1.1", 20);
        let outcome = store.write_emission_record(&second, true).await.unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Replaced {
                previous_id: first.id
            }
        );
        let all = store.emission_records(&[inventory_id]).await.unwrap();
        assert_eq!(all, vec![second]);
    }

    #[tokio::test]
    async fn population_samples_are_windowed_and_most_recent_first() {
        let store = MemoryStore::new();
        let city_id = Uuid::new_v4();
        for year in [2015, 2019, 2022, 2024, 2030] {
            store
                .insert_population(PopulationSample {
                    city_id,
                    year,
                    population: Some(1),
                    region_population: None,
                    country_population: None,
                })
                .await;
        }
        let years: Vec<i32> = store
            .population_samples(city_id, 2018, 2028)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.year)
            .collect();
        assert_eq!(years, vec![2024, 2022, 2019]);
        assert_eq!(store.population_query_count(), 1);
    }
}
