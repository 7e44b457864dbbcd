//! Population scale factors for sources published at country or region level.

use ghgi_core::decimal::ratio;
use ghgi_core::{DataSource, InventoryTarget, PopulationIssue, PopulationSample, ScaleFactorResult};
use ghgi_storage::PopulationStore;
use tracing::{debug, warn};

use crate::ReconcileError;

/// Years either side of the inventory year searched for population samples.
pub const POPULATION_YEAR_TOLERANCE: i32 = 5;

pub fn needs_population(sources: &[DataSource]) -> bool {
    sources.iter().any(|s| s.retrieval_method.is_downscaled())
}

/// The `(year, value)` closest to `year` among samples where `pick` is present.
/// Equal distances on both sides resolve to the more recent year, whatever the
/// input order.
pub fn closest_sample(
    samples: &[PopulationSample],
    year: i32,
    pick: impl Fn(&PopulationSample) -> Option<i64>,
) -> Option<(i32, i64)> {
    samples
        .iter()
        .filter_map(|s| pick(s).map(|value| (s.year, value)))
        .min_by_key(|(sample_year, _)| ((sample_year - year).abs(), -sample_year))
}

/// Derive both ratios from already-fetched samples. Any missing or
/// non-positive population sets `missing-population` and leaves factors at 1.
pub fn scale_factors_from_samples(samples: &[PopulationSample], year: i32) -> ScaleFactorResult {
    let city = closest_sample(samples, year, |s| s.population);
    let region = closest_sample(samples, year, |s| s.region_population);
    let country = closest_sample(samples, year, |s| s.country_population);

    let (Some((_, city)), Some((_, region)), Some((_, country))) = (city, region, country) else {
        return ScaleFactorResult::with_issue(PopulationIssue::MissingPopulation);
    };
    match (ratio(city, country), ratio(city, region)) {
        (Some(country_factor), Some(region_factor)) => ScaleFactorResult {
            country_population_scale_factor: country_factor,
            region_population_scale_factor: region_factor,
            issue: None,
        },
        _ => ScaleFactorResult::with_issue(PopulationIssue::MissingPopulation),
    }
}

/// Resolve scale factors for `target`. The population store is only queried
/// when some applicable source downscales by population.
pub async fn resolve_scale_factors(
    store: &dyn PopulationStore,
    target: &InventoryTarget,
    sources: &[DataSource],
    tolerance_years: i32,
) -> Result<ScaleFactorResult, ReconcileError> {
    if !needs_population(sources) {
        return Ok(ScaleFactorResult::unscaled());
    }
    let year = target.require_year()?;
    let samples = store
        .population_samples(target.city_id, year - tolerance_years, year + tolerance_years)
        .await?;

    let result = scale_factors_from_samples(&samples, year);
    match result.issue {
        Some(issue) => warn!(
            city_id = %target.city_id,
            year,
            samples = samples.len(),
            %issue,
            "population samples incomplete; downscaled sources will fail"
        ),
        None => debug!(
            country_factor = %result.country_population_scale_factor,
            region_factor = %result.region_population_scale_factor,
            "resolved population scale factors"
        ),
    }
    Ok(result)
}
