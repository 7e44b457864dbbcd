use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ghgi_core::Sector;
use ghgi_storage::{InventoryStore, PgStore};
use ghgi_sync::{
    build_fetcher, filter_sources, load_catalog, write_report, GroupStatus, ReconcileConfig,
    Reconciler, ResultsService, SourceApplier,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "ghgi-cli")]
#[command(about = "GHG inventory data-source reconciliation")]
struct Cli {
    /// Log at DEBUG unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Connect catalog data sources to an inventory
    Reconcile {
        #[arg(long)]
        inventory: Uuid,
        /// Overwrite existing emission records
        #[arg(long)]
        force_replace: bool,
        /// Restrict the run to these data source ids
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Print aggregated results as JSON
    Results {
        #[arg(long = "inventory", required = true)]
        inventories: Vec<Uuid>,
        #[arg(long)]
        top: bool,
        /// Scope breakdown for one sector of the first inventory (I..V)
        #[arg(long)]
        sector: Option<Sector>,
    },
    /// Show which catalog sources apply to an inventory
    Catalog {
        #[arg(long)]
        inventory: Uuid,
    },
    Migrate,
    Serve,
}

/// `RUST_LOG` wins when set; otherwise `--verbose` picks debug over info.
fn env_filter(rust_log: Option<&str>, verbose: bool) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

fn init_tracing(verbose: bool) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter(rust_log.as_deref(), verbose))
        .try_init();
}

async fn load_target(store: &PgStore, inventory_id: Uuid) -> Result<ghgi_core::InventoryTarget> {
    store
        .inventory_target(inventory_id)
        .await?
        .with_context(|| format!("inventory {inventory_id} not found"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = ReconcileConfig::from_env();

    match cli.command {
        Commands::Reconcile {
            inventory,
            force_replace,
            sources,
        } => {
            let store = Arc::new(PgStore::connect(&config.database_url).await?);
            let target = load_target(&store, inventory).await?;
            let catalog = load_catalog(&config.catalog_path).await?;
            let fetcher = build_fetcher(&config)?;
            let reconciler = Reconciler::new(SourceApplier::new(store.clone(), fetcher), store)
                .with_max_concurrent_groups(config.max_concurrent_groups)
                .with_tolerance_years(config.population_tolerance_years);

            let report = if sources.is_empty() {
                reconciler
                    .connect_inventory(&target, &catalog, force_replace)
                    .await?
            } else {
                reconciler
                    .connect_sources(&target, &catalog, &sources, force_replace)
                    .await?
            };
            let reports_dir = write_report(&config.workspace_root, &report).await?;
            info!(reports_dir = %reports_dir.display(), "report written");

            for group in &report.groups {
                let status = match &group.status {
                    GroupStatus::Applied { datasource_id, .. } => format!("applied {datasource_id}"),
                    GroupStatus::Exhausted { error } | GroupStatus::Blocked { error } => {
                        error.clone()
                    }
                };
                println!("{}\t{status}", group.gpc_reference_number);
            }
            println!(
                "reconcile complete: run_id={} applied={}/{} removed={} reports={}",
                report.run_id,
                report.applied_count(),
                report.groups.len(),
                report.removed.len(),
                reports_dir.display()
            );
        }
        Commands::Results {
            inventories,
            top,
            sector,
        } => {
            let store = Arc::new(PgStore::connect(&config.database_url).await?);
            let results = ResultsService::new(store);
            let json = match (sector, top) {
                (Some(sector), _) => {
                    serde_json::to_string_pretty(&results.sector_breakdown(inventories[0], sector).await?)?
                }
                (None, true) => serde_json::to_string_pretty(&results.top_subsectors(&inventories).await?)?,
                (None, false) => serde_json::to_string_pretty(&results.sector_totals(&inventories).await?)?,
            };
            println!("{json}");
        }
        Commands::Catalog { inventory } => {
            let store = PgStore::connect(&config.database_url).await?;
            let target = load_target(&store, inventory).await?;
            let catalog = load_catalog(&config.catalog_path).await?;
            let filtered = filter_sources(&target, &catalog)?;
            for source in &filtered.applicable {
                println!(
                    "applicable\t{}\t{}\tpriority={}",
                    source.datasource_id,
                    source
                        .gpc_reference_number()
                        .map(|gpc| gpc.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    source.effective_priority()
                );
            }
            for removed in &filtered.removed {
                println!("removed\t{}\t{}", removed.source.datasource_id, removed.reason);
            }
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            ghgi_web::serve_from_env().await?;
        }
    }

    Ok(())
}
