use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use catalog_sync::database_ops::inspect::inspect_tables;
use catalog_sync::database_ops::store::{PgSyncStore, SyncStore};
use catalog_sync::database_ops::target::PgCatalog;
use catalog_sync::database_ops::transfer::assets::{AssetStore, HttpFetcher};
use catalog_sync::database_ops::transfer::audit::AuditSink;
use catalog_sync::database_ops::transfer::mapping::MappingSpec;
use catalog_sync::database_ops::transfer::{run_transfer, sync_run, RunOptions, RunRequest, SyncError};
use catalog_sync::telemetry::{init_tracing, DEFAULT_FILTER};
use catalog_sync::util::config::SyncConfig;
use catalog_sync::util::db::Db;
use catalog_sync::util::env;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "catalog-sync", version, about = "Mapping-driven catalog sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Transfer a stored run record and record its outcome
    Run {
        #[arg(long)]
        run_id: i64,
        /// Pin a mapping version instead of the latest
        #[arg(long)]
        version: Option<i32>,
        /// Update this existing entity instead of locating one
        #[arg(long)]
        force_entity_id: Option<i64>,
        /// Optional comma-separated list of extra tables to write
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
    },
    /// Transfer a record read from disk (no run record is written)
    File {
        #[arg(long)]
        record: PathBuf,
        #[arg(long)]
        catalog_key: String,
        #[arg(long)]
        category: String,
        /// Use this mapping document instead of the stored one
        #[arg(long)]
        mapping: Option<PathBuf>,
        #[arg(long)]
        version: Option<i32>,
        #[arg(long)]
        force_entity_id: Option<i64>,
    },
    /// Validate a mapping document and store it as the next version
    SaveMapping {
        #[arg(long)]
        catalog_key: String,
        #[arg(long)]
        category: String,
        #[arg(long)]
        mapping: PathBuf,
    },
    /// Print the target schema as the transfer sees it
    Inspect {
        #[arg(long)]
        catalog_key: String,
        /// Comma-separated tables (bare or prefixed)
        #[arg(long, value_delimiter = ',', required = true)]
        tables: Vec<String>,
    },
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn coded(err: SyncError) -> anyhow::Error {
    anyhow!("{}: {}", err.code(), err)
}

async fn open_store(config: &SyncConfig) -> Result<Db> {
    let url = config
        .store_url
        .as_deref()
        .context("mapping store not configured; set SYNC_STORE_DB_URL or DATABASE_URL")?;
    Db::connect(url, config.store_max_connections).await
}

async fn connect_target(config: &SyncConfig, catalog_key: &str) -> Result<PgCatalog> {
    let url = config
        .profile_url(catalog_key)
        .ok_or_else(|| coded(SyncError::ProfileUnresolved(catalog_key.to_string())))?;
    PgCatalog::connect(url, config.connect_timeout)
        .await
        .map_err(|e| coded(SyncError::Connect(e)))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Run {
            run_id,
            version,
            force_entity_id,
            tables,
        } => {
            let db = open_store(&config).await?;
            let store = PgSyncStore::new(db.pool.clone());
            let fetcher = HttpFetcher::new(config.download_timeout);
            let request = RunRequest {
                run_id,
                pinned_version: version,
                forced_entity_id: force_entity_id,
                generic_tables: tables,
            };
            let result = sync_run(&config, &store, &fetcher, request).await;
            db.close().await;
            print_json(&result.map_err(coded)?)?;
        }
        Commands::File {
            record,
            catalog_key,
            category,
            mapping,
            version,
            force_entity_id,
        } => {
            let record = read_json(&record)?;
            let explicit = mapping.as_deref().map(read_json).transpose()?;
            let db = open_store(&config).await?;
            let store = PgSyncStore::new(db.pool.clone());
            let fetcher = HttpFetcher::new(config.download_timeout);
            let asset_store = AssetStore::new(config.asset_root.clone(), config.staging_dir.clone());
            let catalog = connect_target(&config, &catalog_key).await?;

            let opts = RunOptions {
                run_id: None,
                catalog_key: catalog_key.clone(),
                category: category.clone(),
                explicit_mapping: explicit,
                pinned_version: version,
                forced_entity_id: force_entity_id,
                default_prefix: config.default_prefix.clone(),
                generic_tables: None,
            };
            let mut audit = AuditSink::new(None, &catalog_key, &category);
            let result = run_transfer(&catalog, &store, &fetcher, &asset_store, &record, &opts, &mut audit).await;
            if let Err(e) = catalog.close().await {
                warn!(error = %e, "closing target connection failed");
            }
            db.close().await;
            let summary = result.map_err(coded)?;
            print_json(&json!({"summary": summary, "errors": audit.entries()}))?;
        }
        Commands::SaveMapping {
            catalog_key,
            category,
            mapping,
        } => {
            let raw = read_json(&mapping)?;
            MappingSpec::parse(&raw).map_err(|source| {
                coded(SyncError::MappingInvalid {
                    catalog_key: catalog_key.clone(),
                    category: category.clone(),
                    source,
                })
            })?;
            let db = open_store(&config).await?;
            let store = PgSyncStore::new(db.pool.clone());
            let version = store.save_mapping(&catalog_key, &category, &raw).await;
            db.close().await;
            let version = version?;
            info!(%catalog_key, %category, version, "mapping saved");
            print_json(&json!({"catalog_key": catalog_key, "category": category, "version": version}))?;
        }
        Commands::Inspect { catalog_key, tables } => {
            let catalog = connect_target(&config, &catalog_key).await?;
            let report = inspect_tables(&catalog, &tables, &config.default_prefix).await;
            if let Err(e) = catalog.close().await {
                warn!(error = %e, "closing target connection failed");
            }
            print!("{}", report?);
        }
    }
    Ok(())
}
