use indexmap::IndexMap;
use serde_json::Value;

use super::audit::{AuditSink, Failure, OpKind};
use super::rows::prepare_row;
use super::scope::ResolvedScope;
use crate::database_ops::schema_cache::SchemaCache;
use crate::database_ops::target::{CatalogTarget, Row};
use crate::normalization::field_spec::Source;

/// Everything a writer needs for one run. Built once, after the scope is resolved, and
/// threaded through the pipelines in order.
pub struct RunContext<'a> {
    pub schema: &'a SchemaCache<'a>,
    pub scope: &'a ResolvedScope,
    pub record: &'a Value,
    pub audit: &'a mut AuditSink,
    pub entity_id: Option<i64>,
    /// Ids produced by auto-increment inserts, keyed by their column name
    /// (`id_product`, `id_custom_block`, ...). Later rows backfill from here.
    pub generated_ids: IndexMap<String, i64>,
    /// Set once the designated base row is inserted rather than found.
    pub base_created: bool,
}

impl<'a> RunContext<'a> {
    pub fn new(
        schema: &'a SchemaCache<'a>,
        scope: &'a ResolvedScope,
        record: &'a Value,
        audit: &'a mut AuditSink,
    ) -> Self {
        Self {
            schema,
            scope,
            record,
            audit,
            entity_id: None,
            generated_ids: IndexMap::new(),
            base_created: false,
        }
    }

    pub fn target(&self) -> &'a dyn CatalogTarget {
        self.schema.target()
    }

    pub fn source(&self) -> Source<'a> {
        Source::new(self.record)
    }

    pub fn table(&self, bare: &str) -> String {
        self.scope.table_name(bare)
    }

    pub fn set_entity(&mut self, id: i64) {
        self.entity_id = Some(id);
        self.generated_ids
            .insert(super::scope::ENTITY_ID.to_string(), id);
    }

    pub async fn prepare(&mut self, table: &str, row: Row) -> Row {
        prepare_row(self.schema, table, row, self.audit).await
    }

    /// Record a row-level failure, attributing it to the current entity when the writer
    /// did not say otherwise.
    pub fn fail(&mut self, mut failure: Failure) {
        if failure.id_entity.is_none() {
            failure.id_entity = self.entity_id;
        }
        self.audit.record(failure);
    }

    /// Prepare and upsert one row; a failure is recorded and reported as `false`.
    pub async fn upsert_row(
        &mut self,
        table: &str,
        row: Row,
        keys: &[&str],
        shop: Option<i64>,
        lang: Option<i64>,
    ) -> bool {
        if !self.schema.table_exists(table).await {
            return false;
        }
        let row = self.prepare(table, row).await;
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        match self.target().upsert(table, &row, &keys).await {
            Ok(()) => true,
            Err(e) => {
                self.fail(
                    Failure::new(table, OpKind::Upsert, e)
                        .shop(shop)
                        .lang(lang)
                        .payload(&row),
                );
                false
            }
        }
    }

    pub fn collect<T>(&mut self, result: Result<T, Failure>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(f) => {
                self.fail(f);
                None
            }
        }
    }
}
