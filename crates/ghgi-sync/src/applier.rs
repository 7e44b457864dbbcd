//! Source applier: fetch one data source's payload, scale it, and persist it
//! as the emission record for its GPC reference number.

use std::sync::Arc;

use chrono::Utc;
use ghgi_adapters::{
    ActivityPayload, EmissionsFetcher, EmissionsPayload, FetchError, FetchGeography,
    FetchRequest, NotationKeyPayload, PayloadKind, SourcePayload,
};
use ghgi_core::decimal::{scale, to_fixed, DecimalError};
use ghgi_core::{
    ActivityGas, ActivityRecord, ContextError, DataSource, EmissionFactor, EmissionRecord, Gas,
    GasAmount, GpcReferenceNumber, InventoryTarget, PopulationIssue, RetrievalMethod,
    ScaleFactorResult, DEFAULT_GWP_HORIZON_YEARS,
};
use ghgi_storage::{EmissionsStore, StoreError, WriteOutcome};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Coarse classification used to decide how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Data,
    Invariant,
    Transient,
    Storage,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("unsupported retrieval method `{0}`")]
    UnsupportedRetrievalMethod(String),
    #[error("data source {0} is not linked to a subsector or subcategory")]
    MissingReference(String),
    #[error("population scale factors unavailable: {0}")]
    Population(PopulationIssue),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("inventory {inventory_id} already has an emission record for {gpc_reference_number}")]
    DuplicateRecord {
        inventory_id: Uuid,
        gpc_reference_number: GpcReferenceNumber,
    },
    #[error(transparent)]
    Decimal(#[from] DecimalError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ApplyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateRecord {
                inventory_id,
                gpc_reference_number,
            } => Self::DuplicateRecord {
                inventory_id,
                gpc_reference_number,
            },
            other => Self::Store(other),
        }
    }
}

impl ApplyError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::UnsupportedRetrievalMethod(_) | Self::MissingReference(_) | Self::Context(_) => {
                FailureKind::Configuration
            }
            Self::Fetch(FetchError::MissingEndpoint(_) | FetchError::MissingGeography(_)) => {
                FailureKind::Configuration
            }
            Self::Fetch(FetchError::Request(_)) => FailureKind::Transient,
            Self::Fetch(FetchError::HttpStatus { status, .. })
                if *status == 429 || *status >= 500 =>
            {
                FailureKind::Transient
            }
            Self::Fetch(_) | Self::Population(_) | Self::Decimal(_) => FailureKind::Data,
            Self::DuplicateRecord { .. } => FailureKind::Invariant,
            Self::Store(_) => FailureKind::Storage,
        }
    }

    /// Stable issue code attached to a failed candidate.
    pub fn issue(&self) -> String {
        match self {
            Self::UnsupportedRetrievalMethod(_) => "unsupported_retrieval_method".to_string(),
            Self::MissingReference(_) => "missing_gpc_reference".to_string(),
            Self::Population(issue) => issue.as_str().to_string(),
            Self::Fetch(err) => err.issue(),
            Self::DuplicateRecord { .. } => "duplicate_emission_record".to_string(),
            Self::Decimal(_) => "decimal_overflow".to_string(),
            Self::Context(_) => "missing_inventory_year".to_string(),
            Self::Store(_) => "storage_error".to_string(),
        }
    }

    /// Blocking errors stop the whole reference-number group.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::DuplicateRecord { .. })
    }
}

/// `{id, success, issue}` summary of one apply call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyResult {
    pub id: Option<Uuid>,
    pub success: bool,
    pub issue: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedSource {
    pub record_id: Uuid,
    pub datasource_id: String,
    pub gpc_reference_number: GpcReferenceNumber,
    pub co2eq_kg: Option<i64>,
    pub outcome: WriteOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ApplyPlan {
    kind: PayloadKind,
    geography: FetchGeography,
    factor: Decimal,
}

fn plan_for(source: &DataSource, scale: &ScaleFactorResult) -> Result<ApplyPlan, ApplyError> {
    let downscaled = |geography, factor| match scale.issue {
        Some(issue) => Err(ApplyError::Population(issue)),
        None => Ok(ApplyPlan {
            kind: PayloadKind::Emissions,
            geography,
            factor,
        }),
    };
    match &source.retrieval_method {
        RetrievalMethod::GlobalApi => Ok(ApplyPlan {
            kind: PayloadKind::Emissions,
            geography: FetchGeography::City,
            factor: Decimal::ONE,
        }),
        RetrievalMethod::GlobalApiNotationKey => Ok(ApplyPlan {
            kind: PayloadKind::NotationKey,
            geography: FetchGeography::City,
            factor: Decimal::ONE,
        }),
        RetrievalMethod::GlobalApiDownscaledByPopulation => {
            downscaled(FetchGeography::Country, scale.country_population_scale_factor)
        }
        RetrievalMethod::GlobalApiDownscaledByRegionPopulation => {
            downscaled(FetchGeography::Region, scale.region_population_scale_factor)
        }
        RetrievalMethod::Other(tag) => Err(ApplyError::UnsupportedRetrievalMethod(tag.clone())),
    }
}

fn scaled_kg(value: Decimal, factor: Decimal) -> Result<i64, DecimalError> {
    to_fixed(scale(value, factor)?)
}

fn activity_record(activity: ActivityPayload, factor: Decimal) -> Result<ActivityRecord, ApplyError> {
    let mut gases = Vec::with_capacity(activity.gases.len());
    for gas in activity.gases {
        let parsed = Gas::parse(&gas.gas)
            .ok_or_else(|| FetchError::Malformed(format!("unknown gas `{}`", gas.gas)))?;
        // Emission factors are intensities and stay unscaled.
        let emission_factor = match (gas.emission_factor_value, gas.emission_factor_units) {
            (Some(value), Some(units)) => Some(EmissionFactor { value, units }),
            (Some(value), None) => Some(EmissionFactor {
                value,
                units: String::new(),
            }),
            _ => None,
        };
        gases.push(ActivityGas {
            gas: parsed,
            amount_kg: scaled_kg(gas.mass, factor)?,
            emission_factor,
        });
    }
    Ok(ActivityRecord {
        id: Uuid::new_v4(),
        activity_amount: scale(activity.activity_value, factor)?,
        unit: activity.activity_units,
        co2eq_kg: activity
            .co2eq_100yr
            .map(|v| scaled_kg(v, factor))
            .transpose()?,
        metadata: activity.metadata,
        gases,
    })
}

/// Turn a payload into the record to persist. Every gas gets a row, zero
/// included; notation-key records carry no CO2e.
pub fn build_emission_record(
    inventory_id: Uuid,
    datasource_id: &str,
    gpc_reference_number: GpcReferenceNumber,
    payload: SourcePayload,
    factor: Decimal,
) -> Result<EmissionRecord, ApplyError> {
    let mut record = EmissionRecord {
        id: Uuid::new_v4(),
        inventory_id,
        gpc_reference_number,
        co2eq_kg: None,
        co2eq_years: DEFAULT_GWP_HORIZON_YEARS,
        co2eq_20yr_kg: None,
        data_quality: None,
        datasource_id: Some(datasource_id.to_string()),
        unavailable_reason: None,
        unavailable_explanation: None,
        gases: Gas::ALL
            .into_iter()
            .map(|gas| GasAmount { gas, amount_kg: 0 })
            .collect(),
        activities: Vec::new(),
        created_at: Utc::now(),
    };

    match payload {
        SourcePayload::Emissions(EmissionsPayload { totals, records }) => {
            record.gases = vec![
                GasAmount {
                    gas: Gas::Co2,
                    amount_kg: scaled_kg(totals.co2_mass, factor)?,
                },
                GasAmount {
                    gas: Gas::Ch4,
                    amount_kg: scaled_kg(totals.ch4_mass, factor)?,
                },
                GasAmount {
                    gas: Gas::N2o,
                    amount_kg: scaled_kg(totals.n2o_mass, factor)?,
                },
            ];
            record.co2eq_kg = Some(scaled_kg(totals.co2eq_100yr, factor)?);
            record.co2eq_20yr_kg = totals
                .co2eq_20yr
                .map(|v| scaled_kg(v, factor))
                .transpose()?;
            record.data_quality = totals.gpc_quality;
            record.activities = records
                .into_iter()
                .map(|activity| activity_record(activity, factor))
                .collect::<Result<_, _>>()?;
        }
        SourcePayload::NotationKey(NotationKeyPayload {
            unavailable_reason,
            unavailable_explanation,
        }) => {
            record.unavailable_reason = Some(unavailable_reason);
            record.unavailable_explanation = Some(unavailable_explanation);
        }
    }
    Ok(record)
}

/// Applies one data source to one inventory. The fetcher is injected so the
/// HTTP client's lifetime is owned by whoever builds the applier.
#[derive(Clone)]
pub struct SourceApplier {
    store: Arc<dyn EmissionsStore>,
    fetcher: Arc<dyn EmissionsFetcher>,
}

impl SourceApplier {
    pub fn new(store: Arc<dyn EmissionsStore>, fetcher: Arc<dyn EmissionsFetcher>) -> Self {
        Self { store, fetcher }
    }

    pub async fn apply(
        &self,
        source: &DataSource,
        target: &InventoryTarget,
        scale: &ScaleFactorResult,
        force_replace: bool,
    ) -> Result<AppliedSource, ApplyError> {
        let gpc = source
            .gpc_reference_number()
            .ok_or_else(|| ApplyError::MissingReference(source.datasource_id.clone()))?;
        let plan = plan_for(source, scale)?;
        let year = target.require_year()?;

        if !force_replace
            && self
                .store
                .find_emission_record(target.inventory_id, gpc)
                .await?
                .is_some()
        {
            return Err(ApplyError::DuplicateRecord {
                inventory_id: target.inventory_id,
                gpc_reference_number: gpc,
            });
        }

        let request = FetchRequest::new(
            source.datasource_id.clone(),
            source.api_endpoint.clone(),
            plan.kind,
            plan.geography,
            target,
            year,
            gpc,
        );
        let payload = self.fetcher.fetch(&request).await?;
        if !matches!(
            (&payload, plan.kind),
            (SourcePayload::Emissions(_), PayloadKind::Emissions)
                | (SourcePayload::NotationKey(_), PayloadKind::NotationKey)
        ) {
            return Err(FetchError::Malformed(format!(
                "expected a {:?} payload from {}",
                plan.kind, source.datasource_id
            ))
            .into());
        }

        let record = build_emission_record(
            target.inventory_id,
            &source.datasource_id,
            gpc,
            payload,
            plan.factor,
        )?;
        let outcome = self.store.write_emission_record(&record, force_replace).await?;
        info!(
            datasource_id = %source.datasource_id,
            gpc = %gpc,
            record_id = %record.id,
            co2eq_kg = ?record.co2eq_kg,
            factor = %plan.factor,
            replaced = matches!(outcome, WriteOutcome::Replaced { .. }),
            "applied data source"
        );

        Ok(AppliedSource {
            record_id: record.id,
            datasource_id: source.datasource_id.clone(),
            gpc_reference_number: gpc,
            co2eq_kg: record.co2eq_kg,
            outcome,
        })
    }

    /// [`SourceApplier::apply`] flattened to `{id, success, issue}`.
    pub async fn apply_source(
        &self,
        source: &DataSource,
        target: &InventoryTarget,
        scale: &ScaleFactorResult,
        force_replace: bool,
    ) -> ApplyResult {
        match self.apply(source, target, scale, force_replace).await {
            Ok(applied) => ApplyResult {
                id: Some(applied.record_id),
                success: true,
                issue: None,
            },
            Err(err) => ApplyResult {
                id: None,
                success: false,
                issue: Some(err.issue()),
            },
        }
    }
}
