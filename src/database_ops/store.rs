//! Mapping store: versioned mappings, per-table settings, run records and the error log.
//!
//! The Postgres implementation expects the `sync_*` tables to exist already; creating them
//! belongs to whoever owns the store database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::{debug, info, instrument};

use super::transfer::audit::ErrorLogEntry;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionedMapping {
    pub catalog_key: String,
    pub category: String,
    pub version: i32,
    pub mapping: Value,
    pub created_at: DateTime<Utc>,
}

/// Raw per-table settings as persisted; parsed into `StoredTableConfig` by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTableRow {
    pub table_name: String,
    pub settings: Value,
    pub field_overrides: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub catalog_key: String,
    pub category: String,
    pub mapping_version: Option<i32>,
    pub record: Value,
    pub entity_id: Option<i64>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub mapping_version: Option<i32>,
    pub entity_id: Option<i64>,
    pub success: bool,
    pub error: Option<String>,
    /// Column → value summary of what the core writer resolved.
    pub scalars: Value,
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn latest_mapping(&self, catalog_key: &str, category: &str) -> Result<Option<VersionedMapping>>;

    async fn mapping_version(
        &self,
        catalog_key: &str,
        category: &str,
        version: i32,
    ) -> Result<Option<VersionedMapping>>;

    /// The pre-versioning single mapping document, if one was ever stored.
    async fn legacy_mapping(&self, catalog_key: &str, category: &str) -> Result<Option<Value>>;

    /// Stores `mapping` as the next version (max + 1) and returns that version.
    async fn save_mapping(&self, catalog_key: &str, category: &str, mapping: &Value) -> Result<i32>;

    async fn table_settings(&self, catalog_key: &str) -> Result<Vec<StoredTableRow>>;

    async fn load_run(&self, run_id: i64) -> Result<Option<RunRecord>>;

    async fn finish_run(&self, run_id: i64, outcome: &RunOutcome) -> Result<()>;

    async fn append_errors(&self, entries: &[ErrorLogEntry]) -> Result<()>;
}

#[derive(Clone)]
pub struct PgSyncStore {
    pool: PgPool,
}

impl PgSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn mapping_from_row(row: sqlx::postgres::PgRow) -> Result<VersionedMapping> {
        Ok(VersionedMapping {
            catalog_key: row.try_get("catalog_key")?,
            category: row.try_get("category")?,
            version: row.try_get("version")?,
            mapping: row.try_get::<Json<Value>, _>("mapping")?.0,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    #[instrument(skip(self))]
    async fn latest_mapping(&self, catalog_key: &str, category: &str) -> Result<Option<VersionedMapping>> {
        let row = sqlx::query(
            r#"SELECT catalog_key, category, version, mapping, created_at
               FROM sync_mappings
               WHERE catalog_key = $1 AND category = $2
               ORDER BY version DESC
               LIMIT 1"#,
        )
        .persistent(false)
        .bind(catalog_key)
        .bind(category)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::mapping_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn mapping_version(
        &self,
        catalog_key: &str,
        category: &str,
        version: i32,
    ) -> Result<Option<VersionedMapping>> {
        let row = sqlx::query(
            r#"SELECT catalog_key, category, version, mapping, created_at
               FROM sync_mappings
               WHERE catalog_key = $1 AND category = $2 AND version = $3"#,
        )
        .persistent(false)
        .bind(catalog_key)
        .bind(category)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::mapping_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn legacy_mapping(&self, catalog_key: &str, category: &str) -> Result<Option<Value>> {
        let doc: Option<Json<Value>> = sqlx::query_scalar(
            "SELECT mapping FROM sync_mapping_legacy WHERE catalog_key = $1 AND category = $2",
        )
        .persistent(false)
        .bind(catalog_key)
        .bind(category)
        .fetch_optional(&self.pool)
        .await?;
        Ok(doc.map(|j| j.0))
    }

    #[instrument(skip(self, mapping))]
    async fn save_mapping(&self, catalog_key: &str, category: &str, mapping: &Value) -> Result<i32> {
        // (catalog_key, category, version) is unique; a concurrent save fails here.
        let version: i32 = sqlx::query_scalar(
            r#"INSERT INTO sync_mappings (catalog_key, category, version, mapping, created_at)
               SELECT $1, $2, COALESCE(MAX(version), 0) + 1, $3, now()
               FROM sync_mappings
               WHERE catalog_key = $1 AND category = $2
               RETURNING version"#,
        )
        .persistent(false)
        .bind(catalog_key)
        .bind(category)
        .bind(Json(mapping))
        .fetch_one(&self.pool)
        .await
        .context("saving mapping version")?;
        info!(catalog_key, category, version, "mapping version saved");
        Ok(version)
    }

    #[instrument(skip(self))]
    async fn table_settings(&self, catalog_key: &str) -> Result<Vec<StoredTableRow>> {
        let rows = sqlx::query(
            r#"SELECT table_name,
                      COALESCE(settings, '{}'::jsonb) AS settings,
                      COALESCE(field_overrides, '{}'::jsonb) AS field_overrides
               FROM sync_table_settings
               WHERE catalog_key = $1
               ORDER BY table_name"#,
        )
        .persistent(false)
        .bind(catalog_key)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| -> Result<StoredTableRow> {
                Ok(StoredTableRow {
                    table_name: r.try_get("table_name")?,
                    settings: r.try_get::<Json<Value>, _>("settings")?.0,
                    field_overrides: r.try_get::<Json<Value>, _>("field_overrides")?.0,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn load_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        let row = sqlx::query(
            r#"SELECT id, catalog_key, category, mapping_version, record, entity_id,
                      success, error, created_at, updated_at
               FROM sync_runs WHERE id = $1"#,
        )
        .persistent(false)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(r) = row else { return Ok(None) };
        Ok(Some(RunRecord {
            id: r.try_get("id")?,
            catalog_key: r.try_get("catalog_key")?,
            category: r.try_get("category")?,
            mapping_version: r.try_get("mapping_version")?,
            record: r.try_get::<Json<Value>, _>("record")?.0,
            entity_id: r.try_get("entity_id")?,
            success: r.try_get("success")?,
            error: r.try_get("error")?,
            created_at: r.try_get("created_at")?,
            updated_at: r.try_get("updated_at")?,
        }))
    }

    #[instrument(skip(self, outcome), fields(success = outcome.success))]
    async fn finish_run(&self, run_id: i64, outcome: &RunOutcome) -> Result<()> {
        sqlx::query(
            r#"UPDATE sync_runs
               SET mapping_version = $2, entity_id = $3, success = $4, error = $5,
                   scalars = $6, updated_at = now()
               WHERE id = $1"#,
        )
        .persistent(false)
        .bind(run_id)
        .bind(outcome.mapping_version)
        .bind(outcome.entity_id)
        .bind(outcome.success)
        .bind(outcome.error.as_deref())
        .bind(Json(&outcome.scalars))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_errors(&self, entries: &[ErrorLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::new(
            "INSERT INTO sync_error_log (run_id, catalog_key, category, table_name, operation, \
             id_entity, id_shop, id_lang, message, payload, created_at) ",
        );
        qb.push_values(entries, |mut b, e| {
            b.push_bind(e.run_id)
                .push_bind(&e.catalog_key)
                .push_bind(&e.category)
                .push_bind(&e.failure.table)
                .push_bind(e.failure.op.as_str())
                .push_bind(e.failure.id_entity)
                .push_bind(e.failure.id_shop)
                .push_bind(e.failure.id_lang)
                .push_bind(&e.failure.message)
                .push_bind(Json(&e.failure.payload))
                .push_bind(e.created_at);
        });
        qb.build().persistent(false).execute(&self.pool).await?;
        debug!(count = entries.len(), "error log entries appended");
        Ok(())
    }
}
