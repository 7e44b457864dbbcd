//! Source catalog filter: which data sources can serve an inventory.

use std::fmt;

use ghgi_core::{ContextError, DataSource, InventoryTarget};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    ReportingLevelMismatch,
    MissingYearRange,
    YearOutOfRange,
    GeographyMismatch,
}

impl RemovalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReportingLevelMismatch => "reporting level mismatch",
            Self::MissingYearRange => "missing year range",
            Self::YearOutOfRange => "year out of range",
            Self::GeographyMismatch => "geography mismatch",
        }
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedSource {
    pub source: DataSource,
    pub reason: RemovalReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogFilterResult {
    pub applicable: Vec<DataSource>,
    pub removed: Vec<RemovedSource>,
}

/// Judge one source against the target. The universal geography marker skips
/// the year and geography checks but not the reporting level.
pub fn check_source(
    target: &InventoryTarget,
    year: i32,
    source: &DataSource,
) -> Result<(), RemovalReason> {
    if !source.serves(target.reporting_level) {
        return Err(RemovalReason::ReportingLevelMismatch);
    }
    if source.geography.is_universal() {
        return Ok(());
    }

    let (Some(start_year), Some(end_year)) = (source.start_year, source.end_year) else {
        return Err(RemovalReason::MissingYearRange);
    };
    if !(start_year..=end_year).contains(&year) {
        return Err(RemovalReason::YearOutOfRange);
    }
    if !source.geography.covers(target) {
        return Err(RemovalReason::GeographyMismatch);
    }
    Ok(())
}

/// Partition `sources` into applicable and removed, preserving input order.
/// Each source is judged on its own, so the partition never depends on order.
pub fn filter_sources(
    target: &InventoryTarget,
    sources: &[DataSource],
) -> Result<CatalogFilterResult, ContextError> {
    let year = target.require_year()?;
    let mut result = CatalogFilterResult::default();
    for source in sources {
        match check_source(target, year, source) {
            Ok(()) => result.applicable.push(source.clone()),
            Err(reason) => result.removed.push(RemovedSource {
                source: source.clone(),
                reason,
            }),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghgi_core::{GeographyScope, ReportingLevel, RetrievalMethod};
    use uuid::Uuid;

    fn target() -> InventoryTarget {
        InventoryTarget {
            inventory_id: Uuid::nil(),
            city_id: Uuid::nil(),
            year: Some(2023),
            city_code: "AR BUE".into(),
            region_code: Some("AR-C".into()),
            country_code: "AR".into(),
            reporting_level: ReportingLevel::Basic,
        }
    }

    fn source(id: &str, geography: &str, years: Option<(i32, i32)>) -> DataSource {
        DataSource {
            datasource_id: id.into(),
            name: id.into(),
            geography: GeographyScope::parse(geography),
            start_year: years.map(|y| y.0),
            end_year: years.map(|y| y.1),
            retrieval_method: RetrievalMethod::GlobalApi,
            api_endpoint: None,
            priority: None,
            subsector: None,
            subcategory: Some("I.1.1".parse().unwrap()),
            reporting_levels: vec![],
        }
    }

    fn reason_of(result: &CatalogFilterResult, id: &str) -> Option<RemovalReason> {
        result
            .removed
            .iter()
            .find(|r| r.source.datasource_id == id)
            .map(|r| r.reason)
    }

    #[test]
    fn year_range_boundaries() {
        let sources = vec![
            source("exact", "AR", Some((2023, 2023))),
            source("ended-last-year", "AR", Some((2010, 2022))),
            source("starts-next-year", "AR", Some((2024, 2030))),
        ];
        let result = filter_sources(&target(), &sources).unwrap();
        assert_eq!(result.applicable.len(), 1);
        assert_eq!(result.applicable[0].datasource_id, "exact");
        assert_eq!(
            reason_of(&result, "ended-last-year"),
            Some(RemovalReason::YearOutOfRange)
        );
        assert_eq!(
            reason_of(&result, "starts-next-year"),
            Some(RemovalReason::YearOutOfRange)
        );
    }

    #[test]
    fn universal_scope_bypasses_year_checks() {
        let sources = vec![
            source("earth-no-years", "EARTH", None),
            source("earth-old", "EARTH", Some((1990, 2000))),
            source("city-no-years", "AR BUE", None),
        ];
        let result = filter_sources(&target(), &sources).unwrap();
        let ids: Vec<&str> = result
            .applicable
            .iter()
            .map(|s| s.datasource_id.as_str())
            .collect();
        assert_eq!(ids, vec!["earth-no-years", "earth-old"]);
        assert_eq!(
            reason_of(&result, "city-no-years"),
            Some(RemovalReason::MissingYearRange)
        );
    }

    #[test]
    fn geography_matches_country_region_or_city() {
        let sources = vec![
            source("country", "AR", Some((2000, 2030))),
            source("region", "AR-C", Some((2000, 2030))),
            source("city", "AR BUE", Some((2000, 2030))),
            source("elsewhere", "BR,AR COR", Some((2000, 2030))),
        ];
        let result = filter_sources(&target(), &sources).unwrap();
        assert_eq!(result.applicable.len(), 3);
        assert_eq!(
            reason_of(&result, "elsewhere"),
            Some(RemovalReason::GeographyMismatch)
        );
    }

    #[test]
    fn reporting_level_is_checked_first() {
        let mut plus_only = source("plus-only", "EARTH", None);
        plus_only.reporting_levels = vec![ReportingLevel::BasicPlus];
        let result = filter_sources(&target(), &[plus_only]).unwrap();
        assert_eq!(
            reason_of(&result, "plus-only"),
            Some(RemovalReason::ReportingLevelMismatch)
        );
    }

    #[test]
    fn filtering_is_pure_and_order_independent() {
        let sources = vec![
            source("a", "AR", Some((2020, 2025))),
            source("b", "BR", Some((2020, 2025))),
            source("c", "EARTH", None),
            source("d", "AR", None),
        ];
        let first = filter_sources(&target(), &sources).unwrap();
        let second = filter_sources(&target(), &sources).unwrap();
        assert_eq!(first, second);

        let mut reversed = sources.clone();
        reversed.reverse();
        let third = filter_sources(&target(), &reversed).unwrap();
        let mut applicable: Vec<_> = third.applicable.iter().map(|s| &s.datasource_id).collect();
        applicable.sort();
        assert_eq!(applicable, vec!["a", "c"]);
        assert_eq!(third.removed.len(), first.removed.len());
    }

    #[test]
    fn missing_inventory_year_is_a_contract_violation() {
        let mut t = target();
        t.year = None;
        assert_eq!(
            filter_sources(&t, &[]),
            Err(ContextError::MissingYear(Uuid::nil()))
        );
    }
}
