//! Priority reconciliation: per GPC reference number, try candidate sources in
//! descending priority until one applies. Groups run concurrently under a
//! semaphore; candidates inside a group never do.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ghgi_core::{DataSource, GpcReferenceNumber, InventoryTarget, ScaleFactorResult};
use ghgi_storage::PopulationStore;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::applier::{FailureKind, SourceApplier};
use crate::catalog::{filter_sources, RemovedSource};
use crate::population::{resolve_scale_factors, POPULATION_YEAR_TOLERANCE};
use crate::ReconcileError;

pub const DEFAULT_MAX_CONCURRENT_GROUPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub datasource_id: String,
    pub priority: i32,
    pub success: bool,
    pub issue: Option<String>,
    pub kind: Option<FailureKind>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupStatus {
    Applied { datasource_id: String, record_id: Uuid },
    /// Every candidate failed.
    Exhausted { error: String },
    /// A blocking error (an existing record without force-replace) stopped the group.
    Blocked { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupOutcome {
    pub gpc_reference_number: GpcReferenceNumber,
    pub status: GroupStatus,
    pub attempts: Vec<AttemptRecord>,
}

impl GroupOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self.status, GroupStatus::Applied { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigurationIssue {
    pub datasource_id: String,
    pub issue: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub run_id: Uuid,
    pub inventory_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub force_replace: bool,
    pub scale_factors: ScaleFactorResult,
    pub removed: Vec<RemovedSource>,
    pub configuration_errors: Vec<ConfigurationIssue>,
    pub groups: Vec<GroupOutcome>,
}

impl ReconcileReport {
    pub fn applied_count(&self) -> usize {
        self.groups.iter().filter(|g| g.is_applied()).count()
    }

    pub fn failed_groups(&self) -> impl Iterator<Item = &GroupOutcome> {
        self.groups.iter().filter(|g| !g.is_applied())
    }
}

/// Group sources by reference number, each group sorted by descending
/// priority (unset counts as 0) with the id as a stable tie-break. Sources
/// without a reference number are returned as configuration issues.
pub fn group_by_reference(
    sources: &[DataSource],
) -> (BTreeMap<GpcReferenceNumber, Vec<DataSource>>, Vec<ConfigurationIssue>) {
    let mut groups: BTreeMap<GpcReferenceNumber, Vec<DataSource>> = BTreeMap::new();
    let mut unlinked = Vec::new();
    for source in sources {
        match source.gpc_reference_number() {
            Some(gpc) => groups.entry(gpc).or_default().push(source.clone()),
            None => unlinked.push(ConfigurationIssue {
                datasource_id: source.datasource_id.clone(),
                issue: "missing_gpc_reference".to_string(),
            }),
        }
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| {
            Reverse(a.effective_priority())
                .cmp(&Reverse(b.effective_priority()))
                .then_with(|| a.datasource_id.cmp(&b.datasource_id))
        });
    }
    (groups, unlinked)
}

/// Try `candidates` in order; stop at the first success or a blocking error.
pub async fn reconcile_group(
    applier: &SourceApplier,
    target: &InventoryTarget,
    scale: &ScaleFactorResult,
    force_replace: bool,
    gpc: GpcReferenceNumber,
    candidates: &[DataSource],
) -> GroupOutcome {
    let mut attempts = Vec::with_capacity(candidates.len());
    for source in candidates {
        match applier.apply(source, target, scale, force_replace).await {
            Ok(applied) => {
                attempts.push(AttemptRecord {
                    datasource_id: source.datasource_id.clone(),
                    priority: source.effective_priority(),
                    success: true,
                    issue: None,
                    kind: None,
                    message: None,
                });
                return GroupOutcome {
                    gpc_reference_number: gpc,
                    status: GroupStatus::Applied {
                        datasource_id: applied.datasource_id,
                        record_id: applied.record_id,
                    },
                    attempts,
                };
            }
            Err(err) => {
                let kind = err.kind();
                if kind == FailureKind::Configuration {
                    error!(datasource_id = %source.datasource_id, issue = %err.issue(), error = %err, "data source misconfigured");
                } else {
                    warn!(datasource_id = %source.datasource_id, issue = %err.issue(), error = %err, "candidate failed");
                }
                attempts.push(AttemptRecord {
                    datasource_id: source.datasource_id.clone(),
                    priority: source.effective_priority(),
                    success: false,
                    issue: Some(err.issue()),
                    kind: Some(kind),
                    message: Some(err.to_string()),
                });
                if err.is_blocking() {
                    return GroupOutcome {
                        gpc_reference_number: gpc,
                        status: GroupStatus::Blocked {
                            error: err.to_string(),
                        },
                        attempts,
                    };
                }
            }
        }
    }

    let message = format!("no data source available for GPC reference number {gpc}");
    error!(%gpc, attempts = attempts.len(), "{message}");
    GroupOutcome {
        gpc_reference_number: gpc,
        status: GroupStatus::Exhausted { error: message },
        attempts,
    }
}

/// Composes the catalog filter, population resolver and applier for one inventory.
#[derive(Clone)]
pub struct Reconciler {
    applier: SourceApplier,
    population: Arc<dyn PopulationStore>,
    max_concurrent_groups: usize,
    tolerance_years: i32,
}

impl Reconciler {
    pub fn new(applier: SourceApplier, population: Arc<dyn PopulationStore>) -> Self {
        Self {
            applier,
            population,
            max_concurrent_groups: DEFAULT_MAX_CONCURRENT_GROUPS,
            tolerance_years: POPULATION_YEAR_TOLERANCE,
        }
    }

    pub fn with_max_concurrent_groups(mut self, limit: usize) -> Self {
        self.max_concurrent_groups = limit.max(1);
        self
    }

    pub fn with_tolerance_years(mut self, years: i32) -> Self {
        self.tolerance_years = years;
        self
    }

    /// Run every group with at most `max_concurrent_groups` in flight.
    /// Outcomes come back ordered by reference number.
    pub async fn reconcile_groups(
        &self,
        target: &InventoryTarget,
        sources: &[DataSource],
        scale: ScaleFactorResult,
        force_replace: bool,
    ) -> Result<(Vec<GroupOutcome>, Vec<ConfigurationIssue>), ReconcileError> {
        let (groups, unlinked) = group_by_reference(sources);
        for issue in &unlinked {
            error!(datasource_id = %issue.datasource_id, issue = %issue.issue, "data source skipped");
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_groups));
        let mut tasks = JoinSet::new();
        for (gpc, candidates) in groups {
            let applier = self.applier.clone();
            let target = target.clone();
            let semaphore = semaphore.clone();
            let span = info_span!("reconcile_group", gpc = %gpc, candidates = candidates.len());
            tasks.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    reconcile_group(&applier, &target, &scale, force_replace, gpc, &candidates)
                        .await
                }
                .instrument(span),
            );
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            outcomes.push(joined?);
        }
        outcomes.sort_by_key(|o| o.gpc_reference_number);
        Ok((outcomes, unlinked))
    }

    /// Filter the whole catalog for `target` and reconcile what remains.
    pub async fn connect_inventory(
        &self,
        target: &InventoryTarget,
        catalog: &[DataSource],
        force_replace: bool,
    ) -> Result<ReconcileReport, ReconcileError> {
        self.run(target, catalog, Vec::new(), force_replace).await
    }

    /// Reconcile only the named sources. Unknown ids are reported, not fatal.
    pub async fn connect_sources(
        &self,
        target: &InventoryTarget,
        catalog: &[DataSource],
        source_ids: &[String],
        force_replace: bool,
    ) -> Result<ReconcileReport, ReconcileError> {
        let wanted: HashSet<&str> = source_ids.iter().map(String::as_str).collect();
        let known: HashSet<&str> = catalog.iter().map(|s| s.datasource_id.as_str()).collect();
        let selected: Vec<DataSource> = catalog
            .iter()
            .filter(|s| wanted.contains(s.datasource_id.as_str()))
            .cloned()
            .collect();

        let mut reported: HashSet<&str> = HashSet::new();
        let unknown: Vec<ConfigurationIssue> = source_ids
            .iter()
            .filter(|id| !known.contains(id.as_str()) && reported.insert(id.as_str()))
            .map(|id| ConfigurationIssue {
                datasource_id: id.clone(),
                issue: "unknown_data_source".to_string(),
            })
            .collect();
        for issue in &unknown {
            error!(datasource_id = %issue.datasource_id, "requested data source is not in the catalog");
        }

        self.run(target, &selected, unknown, force_replace).await
    }

    async fn run(
        &self,
        target: &InventoryTarget,
        sources: &[DataSource],
        mut configuration_errors: Vec<ConfigurationIssue>,
        force_replace: bool,
    ) -> Result<ReconcileReport, ReconcileError> {
        let span = info_span!(
            "reconcile_inventory",
            inventory_id = %target.inventory_id,
            year = ?target.year,
            force_replace
        );
        async move {
            let run_id = Uuid::new_v4();
            let started_at = Utc::now();

            let filtered = filter_sources(target, sources)?;
            let scale_factors = resolve_scale_factors(
                self.population.as_ref(),
                target,
                &filtered.applicable,
                self.tolerance_years,
            )
            .await?;
            let (groups, unlinked) = self
                .reconcile_groups(target, &filtered.applicable, scale_factors, force_replace)
                .await?;
            configuration_errors.extend(unlinked);

            let report = ReconcileReport {
                run_id,
                inventory_id: target.inventory_id,
                started_at,
                finished_at: Utc::now(),
                force_replace,
                scale_factors,
                removed: filtered.removed,
                configuration_errors,
                groups,
            };
            info!(
                %run_id,
                applicable = filtered.applicable.len(),
                removed = report.removed.len(),
                groups = report.groups.len(),
                applied = report.applied_count(),
                "reconciliation finished"
            );
            Ok::<_, ReconcileError>(report)
        }
        .instrument(span)
        .await
    }
}
