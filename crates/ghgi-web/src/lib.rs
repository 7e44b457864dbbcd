//! Axum JSON API over the reconciliation and results services.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ghgi_adapters::EmissionsFetcher;
use ghgi_core::{DataSource, InventoryTarget, Sector};
use ghgi_storage::{EmissionsStore, InventoryStore, PgStore, PopulationStore, StoreError};
use ghgi_sync::{
    build_fetcher, filter_sources, load_catalog, ReconcileConfig, ReconcileError, Reconciler,
    ResultsService, SourceApplier,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ghgi-web";

#[derive(Clone)]
pub struct AppState {
    pub inventories: Arc<dyn InventoryStore>,
    pub results: ResultsService,
    pub reconciler: Reconciler,
    pub catalog: Arc<Vec<DataSource>>,
}

impl AppState {
    /// Wire every service to one store that serves inventories, population and emissions.
    pub fn new<S>(store: Arc<S>, fetcher: Arc<dyn EmissionsFetcher>, catalog: Vec<DataSource>) -> Self
    where
        S: InventoryStore + PopulationStore + EmissionsStore + 'static,
    {
        let applier = SourceApplier::new(store.clone(), fetcher);
        Self {
            inventories: store.clone(),
            results: ResultsService::new(store.clone()),
            reconciler: Reconciler::new(applier, store),
            catalog: Arc::new(catalog),
        }
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.into())
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Internal(err) => {
                error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/inventories/{id}/sources", get(sources_handler))
        .route("/inventories/{id}/sources/connect", post(connect_handler))
        .route("/inventories/{id}/results/sectors", get(sector_totals_handler))
        .route(
            "/inventories/{id}/results/top-subsectors",
            get(top_subsectors_handler),
        )
        .route(
            "/inventories/{id}/results/sectors/{sector}/breakdown",
            get(sector_breakdown_handler),
        )
        .route("/results/sectors", get(batch_sector_totals_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ReconcileConfig::from_env();
    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    let catalog = load_catalog(&config.catalog_path).await?;
    let fetcher = build_fetcher(&config)?;
    let state = AppState::new(store.clone(), fetcher.clone(), catalog).with_reconciler(
        Reconciler::new(SourceApplier::new(store.clone(), fetcher), store)
            .with_max_concurrent_groups(config.max_concurrent_groups)
            .with_tolerance_years(config.population_tolerance_years),
    );

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving ghgi api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn load_target(state: &AppState, inventory_id: Uuid) -> Result<InventoryTarget, ApiError> {
    state
        .inventories
        .inventory_target(inventory_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("inventory {inventory_id} not found")))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn sources_handler(
    State(state): State<Arc<AppState>>,
    Path(inventory_id): Path<Uuid>,
) -> ApiResult<ghgi_sync::CatalogFilterResult> {
    let target = load_target(&state, inventory_id).await?;
    let result = filter_sources(&target, &state.catalog)
        .map_err(|err| ApiError::Internal(err.into()))?;
    Ok(Json(result))
}

#[derive(Debug, Default, Deserialize)]
struct ConnectRequest {
    #[serde(default)]
    force_replace: bool,
    #[serde(default)]
    source_ids: Option<Vec<String>>,
}

async fn connect_handler(
    State(state): State<Arc<AppState>>,
    Path(inventory_id): Path<Uuid>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<ghgi_sync::ReconcileReport> {
    let target = load_target(&state, inventory_id).await?;
    let report = match &request.source_ids {
        Some(ids) => {
            state
                .reconciler
                .connect_sources(&target, &state.catalog, ids, request.force_replace)
                .await?
        }
        None => {
            state
                .reconciler
                .connect_inventory(&target, &state.catalog, request.force_replace)
                .await?
        }
    };
    Ok(Json(report))
}

async fn sector_totals_handler(
    State(state): State<Arc<AppState>>,
    Path(inventory_id): Path<Uuid>,
) -> ApiResult<Vec<ghgi_sync::SectorTotal>> {
    load_target(&state, inventory_id).await?;
    Ok(Json(state.results.sector_totals(&[inventory_id]).await?))
}

async fn top_subsectors_handler(
    State(state): State<Arc<AppState>>,
    Path(inventory_id): Path<Uuid>,
) -> ApiResult<Vec<ghgi_sync::TopSubsector>> {
    load_target(&state, inventory_id).await?;
    Ok(Json(state.results.top_subsectors(&[inventory_id]).await?))
}

async fn sector_breakdown_handler(
    State(state): State<Arc<AppState>>,
    Path((inventory_id, sector)): Path<(Uuid, String)>,
) -> ApiResult<ghgi_sync::SectorBreakdown> {
    let sector: Sector = sector
        .parse()
        .map_err(|err: ghgi_core::GpcParseError| ApiError::BadRequest(err.to_string()))?;
    load_target(&state, inventory_id).await?;
    Ok(Json(state.results.sector_breakdown(inventory_id, sector).await?))
}

/// `inventory_id` may repeat or hold a comma-separated list. Pairs arrive
/// percent-decoded, so an encoded `%2C` separator splits like a literal comma.
fn inventory_ids_from_query(pairs: &[(String, String)]) -> Result<Vec<Uuid>, ApiError> {
    let mut ids = Vec::new();
    let values = pairs
        .iter()
        .filter(|(key, _)| key == "inventory_id")
        .flat_map(|(_, value)| value.split(','))
        .map(str::trim)
        .filter(|raw| !raw.is_empty());
    for raw in values {
        let id = raw
            .parse::<Uuid>()
            .map_err(|_| ApiError::BadRequest(format!("invalid inventory id `{raw}`")))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Err(ApiError::BadRequest(
            "at least one inventory_id is required".to_string(),
        ));
    }
    Ok(ids)
}

#[derive(Debug, Serialize)]
struct BatchSectorTotals {
    inventory_ids: Vec<Uuid>,
    totals: Vec<ghgi_sync::SectorTotal>,
}

async fn batch_sector_totals_handler(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> ApiResult<BatchSectorTotals> {
    let inventory_ids = inventory_ids_from_query(&pairs)?;
    let totals = state.results.sector_totals(&inventory_ids).await?;
    Ok(Json(BatchSectorTotals {
        inventory_ids,
        totals,
    }))
}
