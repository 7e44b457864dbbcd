//! Core domain model for GHG inventory data-source reconciliation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod decimal;
pub mod gpc;

pub use gpc::{GpcParseError, GpcReferenceNumber, Sector};

pub const CRATE_NAME: &str = "ghgi-core";

/// Geography marker for sources that apply everywhere.
pub const UNIVERSAL_GEOGRAPHY: &str = "EARTH";

/// GWP time horizon recorded on persisted CO2e totals.
pub const DEFAULT_GWP_HORIZON_YEARS: u16 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingLevel {
    Basic,
    BasicPlus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("inventory {0} has no reporting year")]
    MissingYear(Uuid),
}

/// The inventory being reconciled. Read-only for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryTarget {
    pub inventory_id: Uuid,
    /// Also the population lookup key.
    pub city_id: Uuid,
    pub year: Option<i32>,
    pub city_code: String,
    pub region_code: Option<String>,
    pub country_code: String,
    pub reporting_level: ReportingLevel,
}

impl InventoryTarget {
    pub fn require_year(&self) -> Result<i32, ContextError> {
        self.year.ok_or(ContextError::MissingYear(self.inventory_id))
    }
}

/// Declared coverage of a data source: the universal marker or a list of location codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GeographyScope {
    Universal,
    Locations(Vec<String>),
}

impl GeographyScope {
    pub fn parse(raw: &str) -> Self {
        let locations: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        if locations.iter().any(|l| l == UNIVERSAL_GEOGRAPHY) {
            Self::Universal
        } else {
            Self::Locations(locations)
        }
    }

    pub fn is_universal(&self) -> bool {
        matches!(self, Self::Universal)
    }

    /// True if the scope names the target's country, region or exact city code.
    pub fn covers(&self, target: &InventoryTarget) -> bool {
        match self {
            Self::Universal => true,
            Self::Locations(locations) => locations.iter().any(|l| {
                *l == target.country_code
                    || *l == target.city_code
                    || target.region_code.as_deref() == Some(l.as_str())
            }),
        }
    }
}

impl From<String> for GeographyScope {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<GeographyScope> for String {
    fn from(value: GeographyScope) -> Self {
        match value {
            GeographyScope::Universal => UNIVERSAL_GEOGRAPHY.to_string(),
            GeographyScope::Locations(locations) => locations.join(","),
        }
    }
}

/// How a source's payload is fetched and interpreted. Unknown catalog tags are
/// kept verbatim in [`RetrievalMethod::Other`] and rejected when applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RetrievalMethod {
    GlobalApi,
    GlobalApiNotationKey,
    GlobalApiDownscaledByPopulation,
    GlobalApiDownscaledByRegionPopulation,
    Other(String),
}

impl RetrievalMethod {
    pub fn as_str(&self) -> &str {
        match self {
            Self::GlobalApi => "global_api",
            Self::GlobalApiNotationKey => "global_api_notation_key",
            Self::GlobalApiDownscaledByPopulation => "global_api_downscaled_by_population",
            Self::GlobalApiDownscaledByRegionPopulation => {
                "global_api_downscaled_by_region_population"
            }
            Self::Other(tag) => tag,
        }
    }

    pub fn is_downscaled(&self) -> bool {
        matches!(
            self,
            Self::GlobalApiDownscaledByPopulation | Self::GlobalApiDownscaledByRegionPopulation
        )
    }
}

impl From<String> for RetrievalMethod {
    fn from(value: String) -> Self {
        match value.as_str() {
            "global_api" => Self::GlobalApi,
            "global_api_notation_key" => Self::GlobalApiNotationKey,
            "global_api_downscaled_by_population" => Self::GlobalApiDownscaledByPopulation,
            "global_api_downscaled_by_region_population" => {
                Self::GlobalApiDownscaledByRegionPopulation
            }
            _ => Self::Other(value),
        }
    }
}

impl From<RetrievalMethod> for String {
    fn from(value: RetrievalMethod) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog entry for a third-party emissions data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub datasource_id: String,
    #[serde(default)]
    pub name: String,
    pub geography: GeographyScope,
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub end_year: Option<i32>,
    pub retrieval_method: RetrievalMethod,
    #[serde(default)]
    pub api_endpoint: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub subsector: Option<GpcReferenceNumber>,
    #[serde(default)]
    pub subcategory: Option<GpcReferenceNumber>,
    /// Empty means every reporting level.
    #[serde(default)]
    pub reporting_levels: Vec<ReportingLevel>,
}

impl DataSource {
    /// Subcategory wins over subsector when both are linked.
    pub fn gpc_reference_number(&self) -> Option<GpcReferenceNumber> {
        self.subcategory.or(self.subsector)
    }

    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(0)
    }

    pub fn serves(&self, level: ReportingLevel) -> bool {
        self.reporting_levels.is_empty() || self.reporting_levels.contains(&level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Gas {
    #[serde(rename = "CO2")]
    Co2,
    #[serde(rename = "CH4")]
    Ch4,
    #[serde(rename = "N2O")]
    N2o,
}

impl Gas {
    pub const ALL: [Gas; 3] = [Gas::Co2, Gas::Ch4, Gas::N2o];

    pub fn as_str(self) -> &'static str {
        match self {
            Gas::Co2 => "CO2",
            Gas::Ch4 => "CH4",
            Gas::N2o => "N2O",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

impl fmt::Display for Gas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted mass of one gas, in whole kilograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasAmount {
    pub gas: Gas,
    pub amount_kg: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionFactor {
    pub value: Decimal,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityGas {
    pub gas: Gas,
    pub amount_kg: i64,
    pub emission_factor: Option<EmissionFactor>,
}

/// Activity-level detail persisted under an [`EmissionRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub activity_amount: Decimal,
    pub unit: String,
    pub co2eq_kg: Option<i64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub gases: Vec<ActivityGas>,
}

/// One row per (inventory, GPC reference number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmissionRecord {
    pub id: Uuid,
    pub inventory_id: Uuid,
    pub gpc_reference_number: GpcReferenceNumber,
    /// `None` for notation-key rows.
    pub co2eq_kg: Option<i64>,
    pub co2eq_years: u16,
    pub co2eq_20yr_kg: Option<i64>,
    pub data_quality: Option<String>,
    /// `None` for manually entered rows.
    pub datasource_id: Option<String>,
    pub unavailable_reason: Option<String>,
    pub unavailable_explanation: Option<String>,
    pub gases: Vec<GasAmount>,
    pub activities: Vec<ActivityRecord>,
    pub created_at: DateTime<Utc>,
}

impl EmissionRecord {
    pub fn gas_amount(&self, gas: Gas) -> Option<i64> {
        self.gases
            .iter()
            .find(|g| g.gas == gas)
            .map(|g| g.amount_kg)
    }
}

/// Population figures for one city and year; any column may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationSample {
    pub city_id: Uuid,
    pub year: i32,
    pub population: Option<i64>,
    pub region_population: Option<i64>,
    pub country_population: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PopulationIssue {
    #[serde(rename = "missing-population")]
    MissingPopulation,
}

impl PopulationIssue {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingPopulation => "missing-population",
        }
    }
}

impl fmt::Display for PopulationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Population ratios used to downscale coarse-geography sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleFactorResult {
    pub country_population_scale_factor: Decimal,
    pub region_population_scale_factor: Decimal,
    pub issue: Option<PopulationIssue>,
}

impl ScaleFactorResult {
    pub fn unscaled() -> Self {
        Self {
            country_population_scale_factor: Decimal::ONE,
            region_population_scale_factor: Decimal::ONE,
            issue: None,
        }
    }

    pub fn with_issue(issue: PopulationIssue) -> Self {
        Self {
            issue: Some(issue),
            ..Self::unscaled()
        }
    }
}

impl Default for ScaleFactorResult {
    fn default() -> Self {
        Self::unscaled()
    }
}
