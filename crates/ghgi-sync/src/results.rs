//! Read-only aggregation over persisted emission records.
//!
//! Records without a CO2e total (notation keys) are ignored everywhere, so a
//! sector or subsector appears only if it has at least one numeric row. Sums
//! stay in [`Decimal`]; percentages go through [`ghgi_core::decimal::percentage`]
//! and round half away from zero.

use std::collections::BTreeMap;
use std::sync::Arc;

use ghgi_core::decimal::{from_fixed, percentage, sum_fixed};
use ghgi_core::{EmissionRecord, GpcReferenceNumber, Sector};
use ghgi_storage::{EmissionsStore, StoreError};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

pub const TOP_SUBSECTOR_COUNT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectorTotal {
    pub inventory_id: Uuid,
    pub sector: Sector,
    pub sector_name: String,
    pub co2eq_kg: Decimal,
    pub percentage: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopSubsector {
    pub inventory_id: Uuid,
    pub sector: Sector,
    pub subsector_reference: GpcReferenceNumber,
    pub subsector_name: String,
    pub co2eq_kg: Decimal,
    pub percentage: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeTotal {
    /// `None` for records filed at subsector level.
    pub scope: Option<u8>,
    pub co2eq_kg: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubsectorBreakdown {
    pub subsector_reference: GpcReferenceNumber,
    pub subsector_name: String,
    pub co2eq_kg: Decimal,
    /// Share of the sector total.
    pub percentage: i32,
    pub scopes: Vec<ScopeTotal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectorBreakdown {
    pub inventory_id: Uuid,
    pub sector: Sector,
    pub sector_name: String,
    pub co2eq_kg: Decimal,
    pub subsectors: Vec<SubsectorBreakdown>,
}

fn numeric(records: &[EmissionRecord]) -> impl Iterator<Item = (&EmissionRecord, i64)> {
    records
        .iter()
        .filter_map(|r| r.co2eq_kg.map(|co2eq| (r, co2eq)))
}

fn grand_totals(records: &[EmissionRecord]) -> BTreeMap<Uuid, Decimal> {
    let mut totals: BTreeMap<Uuid, Vec<i64>> = BTreeMap::new();
    for (record, co2eq) in numeric(records) {
        totals.entry(record.inventory_id).or_default().push(co2eq);
    }
    totals
        .into_iter()
        .map(|(inventory_id, values)| (inventory_id, sum_fixed(values)))
        .collect()
}

/// CO2e per (inventory, sector), ordered by inventory then sector.
pub fn sector_totals(records: &[EmissionRecord]) -> Vec<SectorTotal> {
    let grand = grand_totals(records);
    let mut sums: BTreeMap<(Uuid, Sector), Decimal> = BTreeMap::new();
    for (record, co2eq) in numeric(records) {
        *sums
            .entry((record.inventory_id, record.gpc_reference_number.sector()))
            .or_default() += from_fixed(co2eq);
    }

    sums.into_iter()
        .map(|((inventory_id, sector), co2eq_kg)| SectorTotal {
            inventory_id,
            sector,
            sector_name: sector.name().to_string(),
            co2eq_kg,
            percentage: percentage(co2eq_kg, grand.get(&inventory_id).copied().unwrap_or_default()),
        })
        .collect()
}

/// The `limit` largest subsectors per inventory. Equal totals rank by reference number.
pub fn top_subsectors(records: &[EmissionRecord], limit: usize) -> Vec<TopSubsector> {
    let grand = grand_totals(records);
    let mut sums: BTreeMap<Uuid, BTreeMap<GpcReferenceNumber, Decimal>> = BTreeMap::new();
    for (record, co2eq) in numeric(records) {
        *sums
            .entry(record.inventory_id)
            .or_default()
            .entry(record.gpc_reference_number.subsector_reference())
            .or_default() += from_fixed(co2eq);
    }

    let mut out = Vec::new();
    for (inventory_id, subsectors) in sums {
        let total = grand.get(&inventory_id).copied().unwrap_or_default();
        let mut ranked: Vec<(GpcReferenceNumber, Decimal)> = subsectors.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out.extend(ranked.into_iter().take(limit).map(|(reference, co2eq_kg)| TopSubsector {
            inventory_id,
            sector: reference.sector(),
            subsector_reference: reference,
            subsector_name: reference.subsector_name().to_string(),
            co2eq_kg,
            percentage: percentage(co2eq_kg, total),
        }));
    }
    out
}

/// Subsector and scope totals for one sector of one inventory.
pub fn sector_breakdown(
    records: &[EmissionRecord],
    inventory_id: Uuid,
    sector: Sector,
) -> SectorBreakdown {
    let mut subsectors: BTreeMap<GpcReferenceNumber, BTreeMap<Option<u8>, Decimal>> =
        BTreeMap::new();
    for (record, co2eq) in numeric(records) {
        let gpc = record.gpc_reference_number;
        if record.inventory_id != inventory_id || gpc.sector() != sector {
            continue;
        }
        *subsectors
            .entry(gpc.subsector_reference())
            .or_default()
            .entry(gpc.scope())
            .or_default() += from_fixed(co2eq);
    }

    let sector_total: Decimal = subsectors.values().flat_map(|scopes| scopes.values()).sum();
    SectorBreakdown {
        inventory_id,
        sector,
        sector_name: sector.name().to_string(),
        co2eq_kg: sector_total,
        subsectors: subsectors
            .into_iter()
            .map(|(reference, scopes)| {
                let co2eq_kg: Decimal = scopes.values().sum();
                SubsectorBreakdown {
                    subsector_reference: reference,
                    subsector_name: reference.subsector_name().to_string(),
                    co2eq_kg,
                    percentage: percentage(co2eq_kg, sector_total),
                    scopes: scopes
                        .into_iter()
                        .map(|(scope, co2eq_kg)| ScopeTotal { scope, co2eq_kg })
                        .collect(),
                }
            })
            .collect(),
    }
}

/// Store-backed wrapper; each call reads the records once.
#[derive(Clone)]
pub struct ResultsService {
    store: Arc<dyn EmissionsStore>,
}

impl ResultsService {
    pub fn new(store: Arc<dyn EmissionsStore>) -> Self {
        Self { store }
    }

    pub async fn sector_totals(&self, inventory_ids: &[Uuid]) -> Result<Vec<SectorTotal>, StoreError> {
        let records = self.store.emission_records(inventory_ids).await?;
        Ok(sector_totals(&records))
    }

    pub async fn top_subsectors(
        &self,
        inventory_ids: &[Uuid],
    ) -> Result<Vec<TopSubsector>, StoreError> {
        let records = self.store.emission_records(inventory_ids).await?;
        Ok(top_subsectors(&records, TOP_SUBSECTOR_COUNT))
    }

    pub async fn sector_breakdown(
        &self,
        inventory_id: Uuid,
        sector: Sector,
    ) -> Result<SectorBreakdown, StoreError> {
        let records = self.store.emission_records(&[inventory_id]).await?;
        Ok(sector_breakdown(&records, inventory_id, sector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ghgi_core::{Gas, GasAmount, DEFAULT_GWP_HORIZON_YEARS};
    use ghgi_storage::MemoryStore;
    use rust_decimal_macros::dec;

    fn record(inventory_id: Uuid, gpc: &str, co2eq_kg: Option<i64>) -> EmissionRecord {
        EmissionRecord {
            id: Uuid::new_v4(),
            inventory_id,
            gpc_reference_number: gpc.parse().unwrap(),
            co2eq_kg,
            co2eq_years: DEFAULT_GWP_HORIZON_YEARS,
            co2eq_20yr_kg: None,
            data_quality: None,
            datasource_id: Some("test".into()),
            unavailable_reason: co2eq_kg.is_none().then(|| "NE".to_string()),
            unavailable_explanation: co2eq_kg.is_none().then(|| "not estimated".to_string()),
            gases: Gas::ALL
                .into_iter()
                .map(|gas| GasAmount { gas, amount_kg: 0 })
                .collect(),
            activities: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn sector_percentages_round_half_away_from_zero() {
        let inv = Uuid::new_v4();
        let records = vec![
            record(inv, "I.1.1", Some(1)),
            record(inv, "II.1.1", Some(5)),
            record(inv, "II.2.1", Some(2)),
            record(inv, "III.1.1", None),
        ];
        let totals = sector_totals(&records);
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].sector, Sector::I);
        assert_eq!(totals[0].co2eq_kg, dec!(1));
        // 12.5% and 87.5%
        assert_eq!(totals[0].percentage, 13);
        assert_eq!(totals[1].percentage, 88);
        assert_eq!(totals[1].sector_name, "Transportation");
    }

    #[test]
    fn zero_grand_total_gives_zero_percentages() {
        let inv = Uuid::new_v4();
        let totals = sector_totals(&[record(inv, "I.1.1", Some(0)), record(inv, "IV.1", Some(0))]);
        assert_eq!(totals.len(), 2);
        assert!(totals.iter().all(|t| t.percentage == 0));
        assert!(sector_totals(&[]).is_empty());
    }

    #[test]
    fn batch_totals_keep_inventories_apart() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let records = vec![
            record(b, "I.1.1", Some(30)),
            record(a, "I.1.1", Some(10)),
            record(b, "V.1.1", Some(10)),
        ];
        let totals = sector_totals(&records);
        let summary: Vec<(Uuid, Sector, i32)> = totals
            .iter()
            .map(|t| (t.inventory_id, t.sector, t.percentage))
            .collect();
        assert_eq!(
            summary,
            vec![(a, Sector::I, 100), (b, Sector::I, 75), (b, Sector::V, 25)]
        );
    }

    #[test]
    fn top_subsectors_rank_by_total_then_reference() {
        let inv = Uuid::new_v4();
        let records = vec![
            record(inv, "I.1.1", Some(10)),
            record(inv, "I.1.2", Some(30)),
            record(inv, "II.1.1", Some(40)),
            record(inv, "III.1.1", Some(40)),
            record(inv, "IV.2", Some(5)),
            record(inv, "V.1.1", None),
        ];
        let top = top_subsectors(&records, TOP_SUBSECTOR_COUNT);
        let refs: Vec<String> = top.iter().map(|t| t.subsector_reference.to_string()).collect();
        assert_eq!(refs, vec!["I.1", "II.1", "III.1"]);
        assert_eq!(top[0].co2eq_kg, dec!(40));
        assert_eq!(top[0].subsector_name, "Residential buildings");
        // 40 / 125
        assert_eq!(top[1].percentage, 32);
    }

    #[test]
    fn breakdown_groups_by_subsector_then_scope() {
        let inv = Uuid::new_v4();
        let records = vec![
            record(inv, "I.1.1", Some(60)),
            record(inv, "I.1.2", Some(20)),
            record(inv, "I.2", Some(20)),
            record(inv, "II.1.1", Some(1_000)),
            record(Uuid::new_v4(), "I.1.1", Some(1_000)),
        ];
        let breakdown = sector_breakdown(&records, inv, Sector::I);
        assert_eq!(breakdown.co2eq_kg, dec!(100));
        assert_eq!(breakdown.subsectors.len(), 2);

        let residential = &breakdown.subsectors[0];
        assert_eq!(residential.subsector_reference.to_string(), "I.1");
        assert_eq!(residential.percentage, 80);
        assert_eq!(
            residential.scopes,
            vec![
                ScopeTotal { scope: Some(1), co2eq_kg: dec!(60) },
                ScopeTotal { scope: Some(2), co2eq_kg: dec!(20) },
            ]
        );
        assert_eq!(breakdown.subsectors[1].scopes[0].scope, None);

        assert!(sector_breakdown(&records, inv, Sector::IV).subsectors.is_empty());
    }

    #[tokio::test]
    async fn service_queries_are_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let inv = Uuid::new_v4();
        for (gpc, value) in [("I.1.1", 7), ("II.1.1", 11), ("III.4.1", 13)] {
            store
                .write_emission_record(&record(inv, gpc, Some(value)), false)
                .await
                .unwrap();
        }
        let service = ResultsService::new(store);

        let first = serde_json::to_vec(&service.sector_totals(&[inv]).await.unwrap()).unwrap();
        let second = serde_json::to_vec(&service.sector_totals(&[inv]).await.unwrap()).unwrap();
        assert_eq!(first, second);

        let top = service.top_subsectors(&[inv]).await.unwrap();
        assert_eq!(top.len(), 3);
        let breakdown = service.sector_breakdown(inv, Sector::III).await.unwrap();
        assert_eq!(breakdown.subsectors[0].percentage, 100);
    }
}
