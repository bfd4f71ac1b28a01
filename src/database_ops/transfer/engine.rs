//! One transfer run: resolve the mapping and scope, write the entity, then run every
//! enabled pipeline in order. Row-level failures land in the audit sink; only the
//! `SyncError` cases abort.
//!
//! Products own the core tables and every pipeline. Any other entity kind is written by
//! the generic writer alone, through its base table and that table's satellites.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use super::assets::{write_documents, write_images, AssetFetcher, AssetPipeline, AssetStore};
use super::audit::AuditSink;
use super::context::RunContext;
use super::entity::{upsert_entity, EntityOutcome};
use super::error::{SyncError, SyncResult};
use super::fanout::{write_lang_rows, write_shop_rows, write_stock_rows};
use super::features::write_features;
use super::generic::{write_generic_tables, write_secondary_entity};
use super::mapping::{SendSettings, StoredTableConfig};
use super::scope::{load_mapping, resolve_scope, MappingRequest};
use super::variants::write_variants;
use crate::database_ops::schema_cache::SchemaCache;
use crate::database_ops::store::{RunOutcome, SyncStore};
use crate::database_ops::target::{CatalogTarget, PgCatalog};
use crate::util::config::SyncConfig;

/// Which kind of catalog entity a category stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Product,
    Other,
}

impl EntityKind {
    pub fn of_category(category: &str) -> Self {
        match category.trim().to_ascii_lowercase().as_str() {
            "product" | "products" | "item" | "items" | "article" | "articles" => EntityKind::Product,
            _ => EntityKind::Other,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<i64>,
    pub catalog_key: String,
    pub category: String,
    pub explicit_mapping: Option<Value>,
    pub pinned_version: Option<i32>,
    pub forced_entity_id: Option<i64>,
    /// Used when neither the mapping nor the stored settings name a prefix.
    pub default_prefix: String,
    /// Narrows the generic writer to these tables (for other entity kinds: their satellites).
    pub generic_tables: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub entity_id: i64,
    pub created: bool,
    pub mapping_version: Option<i32>,
    pub pipelines: Vec<String>,
    pub failures: usize,
    pub truncations: usize,
    pub scalars: Value,
}

async fn stored_tables(store: &dyn SyncStore, opts: &RunOptions) -> SyncResult<Vec<StoredTableConfig>> {
    let rows = store.table_settings(&opts.catalog_key).await.map_err(SyncError::Store)?;
    rows.iter()
        .map(|r| {
            StoredTableConfig::parse(&r.table_name, &r.settings, &r.field_overrides).map_err(|source| {
                SyncError::MappingInvalid {
                    catalog_key: opts.catalog_key.clone(),
                    category: opts.category.clone(),
                    source,
                }
            })
        })
        .collect()
}

async fn product_pipelines(
    ctx: &mut RunContext<'_>,
    entity: &EntityOutcome,
    send: &SendSettings,
    fetcher: &dyn AssetFetcher,
    asset_store: &AssetStore,
    opts: &RunOptions,
) -> Vec<String> {
    let id = entity.id;
    let mut pipelines = vec!["entity".to_string()];

    write_shop_rows(ctx, id).await;
    write_lang_rows(ctx, id).await;
    write_stock_rows(ctx, id).await;
    pipelines.extend(["shops", "langs", "stock"].map(String::from));

    if send.generic {
        write_generic_tables(ctx, opts.generic_tables.as_deref()).await;
        pipelines.push("generic".into());
    }
    if send.attributes {
        write_variants(ctx, id).await;
        pipelines.push("variants".into());
    }
    if send.features {
        write_features(ctx, id).await;
        pipelines.push("features".into());
    }
    let assets = AssetPipeline {
        fetcher,
        store: asset_store,
    };
    if send.documents {
        write_documents(ctx, &assets, id).await;
        pipelines.push("documents".into());
    }
    if send.images {
        write_images(ctx, &assets, id).await;
        pipelines.push("images".into());
    }
    pipelines
}

/// Transfer one record into an already connected target.
#[instrument(
    skip(target, store, fetcher, asset_store, record, opts, audit),
    fields(catalog_key = %opts.catalog_key, category = %opts.category, run_id = ?opts.run_id)
)]
pub async fn run_transfer(
    target: &dyn CatalogTarget,
    store: &dyn SyncStore,
    fetcher: &dyn AssetFetcher,
    asset_store: &AssetStore,
    record: &Value,
    opts: &RunOptions,
    audit: &mut AuditSink,
) -> SyncResult<TransferSummary> {
    let request = MappingRequest {
        catalog_key: opts.catalog_key.clone(),
        category: opts.category.clone(),
        explicit: opts.explicit_mapping.clone(),
        pinned_version: opts.pinned_version,
    };
    let loaded = load_mapping(store, &request).await?;
    let stored = stored_tables(store, opts).await?;

    let schema = SchemaCache::new(target);
    let mut scope = resolve_scope(&schema, loaded, &stored, &opts.default_prefix).await;
    let kind = EntityKind::of_category(&opts.category);
    scope.base_table = match kind {
        EntityKind::Product => scope.flagged_base(),
        EntityKind::Other => Some(scope.entity_table(&opts.category)),
    };
    let send = scope.mapping.send.clone();

    let mut ctx = RunContext::new(&schema, &scope, record, audit);
    let (entity, pipelines) = match kind {
        EntityKind::Product => {
            let entity = upsert_entity(&mut ctx, opts.forced_entity_id).await?;
            let pipelines = product_pipelines(&mut ctx, &entity, &send, fetcher, asset_store, opts).await;
            (entity, pipelines)
        }
        EntityKind::Other => {
            let base = scope.entity_table(&opts.category);
            let entity =
                write_secondary_entity(&mut ctx, &base, opts.generic_tables.as_deref(), opts.forced_entity_id).await?;
            (entity, vec!["entity".to_string(), "generic".to_string()])
        }
    };
    let id = entity.id;

    let failures = audit.failure_count();
    let truncations = audit.len() - failures;
    info!(entity_id = id, created = entity.created, failures, truncations, "transfer finished");
    Ok(TransferSummary {
        entity_id: id,
        created: entity.created,
        mapping_version: scope.mapping_version,
        pipelines,
        failures,
        truncations,
        scalars: serde_json::to_value(&entity.scalars).unwrap_or(Value::Null),
    })
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub run_id: i64,
    pub pinned_version: Option<i32>,
    pub forced_entity_id: Option<i64>,
    pub generic_tables: Option<Vec<String>>,
}

fn outcome_of(result: &SyncResult<TransferSummary>, pinned: Option<i32>) -> RunOutcome {
    match result {
        Ok(summary) => RunOutcome {
            mapping_version: summary.mapping_version,
            entity_id: Some(summary.entity_id),
            success: true,
            error: None,
            scalars: summary.scalars.clone(),
        },
        Err(err) => RunOutcome {
            mapping_version: pinned,
            entity_id: None,
            success: false,
            error: Some(format!("{}: {}", err.code(), err)),
            scalars: json!({}),
        },
    }
}

/// Load a stored run record, connect to its catalog, transfer, and write the outcome and
/// the audit entries back to the store. The target connection is closed on every path.
#[instrument(skip(config, store, fetcher, request), fields(run_id = request.run_id))]
pub async fn sync_run(
    config: &SyncConfig,
    store: &dyn SyncStore,
    fetcher: &dyn AssetFetcher,
    request: RunRequest,
) -> SyncResult<TransferSummary> {
    let run = store
        .load_run(request.run_id)
        .await
        .map_err(SyncError::Store)?
        .ok_or(SyncError::RunNotFound(request.run_id))?;
    let url = config
        .profile_url(&run.catalog_key)
        .ok_or_else(|| SyncError::ProfileUnresolved(run.catalog_key.clone()))?;
    let catalog = PgCatalog::connect(url, config.connect_timeout)
        .await
        .map_err(SyncError::Connect)?;

    let opts = RunOptions {
        run_id: Some(run.id),
        catalog_key: run.catalog_key.clone(),
        category: run.category.clone(),
        explicit_mapping: None,
        pinned_version: request.pinned_version.or(run.mapping_version),
        forced_entity_id: request.forced_entity_id,
        default_prefix: config.default_prefix.clone(),
        generic_tables: request.generic_tables.clone(),
    };
    let asset_store = AssetStore::new(config.asset_root.clone(), config.staging_dir.clone());
    let mut audit = AuditSink::new(Some(run.id), &run.catalog_key, &run.category);
    let result = run_transfer(&catalog, store, fetcher, &asset_store, &run.record, &opts, &mut audit).await;
    if let Err(e) = catalog.close().await {
        warn!(error = %e, "closing target connection failed");
    }

    let outcome = outcome_of(&result, opts.pinned_version);
    let persisted = async {
        store.finish_run(run.id, &outcome).await?;
        store.append_errors(audit.entries()).await
    }
    .await;
    match (result, persisted) {
        (Ok(summary), Ok(())) => Ok(summary),
        (Ok(_), Err(e)) => Err(SyncError::Store(e)),
        (Err(err), stored) => {
            if let Err(e) = stored {
                warn!(error = %e, "recording the failed run failed");
            }
            Err(err)
        }
    }
}
