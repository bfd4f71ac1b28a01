use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::target::{CatalogTarget, ColumnInfo, TableInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnCategory {
    Numeric,
    Date,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnType {
    pub category: ColumnCategory,
    pub nullable: bool,
    /// Numeric category, but bound as `true`/`false`.
    pub boolean: bool,
}

impl ColumnType {
    pub fn of(col: &ColumnInfo) -> Self {
        Self {
            category: category_of(&col.data_type),
            nullable: col.nullable,
            boolean: col.data_type.trim().to_ascii_lowercase().starts_with("boolean"),
        }
    }
}

pub fn category_of(data_type: &str) -> ColumnCategory {
    let t = data_type.trim().to_ascii_lowercase();
    const NUMERIC: [&str; 13] = [
        "smallint", "integer", "bigint", "int", "numeric", "decimal", "real", "double",
        "float", "serial", "bigserial", "money", "boolean",
    ];
    const DATE: [&str; 4] = ["timestamp", "date", "time", "interval"];
    if DATE.iter().any(|p| t.starts_with(p)) || t == "datetime" {
        ColumnCategory::Date
    } else if NUMERIC.iter().any(|p| t.starts_with(p)) || t == "tinyint" {
        ColumnCategory::Numeric
    } else {
        ColumnCategory::Text
    }
}

/// Introspection results for one run's connection.
///
/// Tables are described on first touch (one metadata round trip per table) and kept for
/// the lifetime of the cache. Build a new cache per run: the target schema may change
/// between runs.
pub struct SchemaCache<'a> {
    target: &'a dyn CatalogTarget,
    tables: Mutex<HashMap<String, Option<Arc<TableInfo>>>>,
}

impl<'a> SchemaCache<'a> {
    pub fn new(target: &'a dyn CatalogTarget) -> Self {
        Self {
            target,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn target(&self) -> &'a dyn CatalogTarget {
        self.target
    }

    pub async fn table(&self, table: &str) -> Option<Arc<TableInfo>> {
        if let Some(hit) = self
            .tables
            .lock()
            .ok()
            .and_then(|cache| cache.get(table).cloned())
        {
            return hit;
        }
        match self.target.describe_table(table).await {
            Ok(found) => {
                let found = found.map(Arc::new);
                debug!(table, exists = found.is_some(), "schema cache miss");
                if let Ok(mut cache) = self.tables.lock() {
                    cache.insert(table.to_string(), found.clone());
                }
                found
            }
            Err(err) => {
                // Not cached: a transient failure should not hide the table for the whole run.
                warn!(table, error = %err, "table introspection failed; treating as missing");
                None
            }
        }
    }

    pub async fn table_exists(&self, table: &str) -> bool {
        self.table(table).await.is_some()
    }

    pub async fn column_exists(&self, table: &str, column: &str) -> bool {
        self.table(table)
            .await
            .is_some_and(|t| t.has_column(column))
    }

    pub async fn primary_key(&self, table: &str) -> Vec<String> {
        self.table(table)
            .await
            .map(|t| t.primary_key.clone())
            .unwrap_or_default()
    }

    /// Declared character limit; 0 when unknown or unbounded.
    pub async fn column_max_length(&self, table: &str, column: &str) -> usize {
        self.table(table)
            .await
            .and_then(|t| t.column(column).and_then(|c| c.max_length))
            .filter(|m| *m > 0)
            .map_or(0, |m| m as usize)
    }

    /// `None` when the table or the column is missing.
    pub async fn column_type(&self, table: &str, column: &str) -> Option<ColumnType> {
        self.table(table)
            .await
            .and_then(|t| t.column(column).map(ColumnType::of))
    }
}
