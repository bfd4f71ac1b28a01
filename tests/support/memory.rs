//! In-memory stand-ins for the target catalog, the mapping store and the downloader.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use catalog_sync::database_ops::store::{RunOutcome, RunRecord, StoredTableRow, SyncStore, VersionedMapping};
use catalog_sync::database_ops::target::{updatable, CatalogTarget, ColumnInfo, Row, TableInfo};
use catalog_sync::database_ops::transfer::assets::{AssetFetcher, Fetched};
use catalog_sync::database_ops::transfer::audit::ErrorLogEntry;
use chrono::Utc;
use serde_json::Value;

/// Loose equality the way a SQL comparison treats JSON-bound values: numbers by value,
/// numeric strings against numbers, booleans against 0/1.
pub fn same(a: &Value, b: &Value) -> bool {
    fn num(v: &Value) -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(x), Value::String(y)) => x == y,
        _ => match (num(a), num(b)) {
            (Some(x), Some(y)) => (x - y).abs() < 1e-9,
            _ => a == b,
        },
    }
}

#[derive(Debug, Clone)]
pub struct MemTable {
    pub info: TableInfo,
    pub rows: Vec<Row>,
    next_id: i64,
}

impl MemTable {
    fn auto_column(&self) -> Option<&str> {
        self.info
            .columns
            .iter()
            .find(|c| c.auto_increment)
            .map(|c| c.name.as_str())
    }

    fn matches(row: &Row, filters: &Row) -> bool {
        filters
            .iter()
            .all(|(k, v)| same(row.get(k).unwrap_or(&Value::Null), v))
    }

    fn check_columns(&self, name: &str, row: &Row) -> Result<()> {
        for col in row.keys() {
            if !self.info.has_column(col) {
                bail!("column \"{col}\" of relation \"{name}\" does not exist");
            }
        }
        Ok(())
    }

    fn push(&mut self, mut row: Row) -> Option<i64> {
        let mut id = None;
        if let Some(auto) = self.auto_column().map(str::to_string) {
            match row.get(&auto).and_then(Value::as_i64) {
                Some(given) => {
                    self.next_id = self.next_id.max(given + 1);
                    id = Some(given);
                }
                None => {
                    id = Some(self.next_id);
                    row.insert(auto, Value::from(self.next_id));
                    self.next_id += 1;
                }
            }
        }
        self.rows.push(row);
        id
    }
}

/// A failure injected into upserts: rows of `table` whose `column` equals `value`.
#[derive(Debug, Clone)]
pub struct FailRule {
    pub table: String,
    pub column: String,
    pub value: Value,
}

#[derive(Default)]
pub struct MemoryCatalog {
    tables: Mutex<BTreeMap<String, MemTable>>,
    fail_rules: Mutex<Vec<FailRule>>,
}

/// `(name, type, max_length, nullable, auto_increment)`
pub type ColumnDef<'a> = (&'a str, &'a str, Option<i64>, bool, bool);

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, name: &str, primary_key: &[&str], columns: &[ColumnDef<'_>]) {
        let info = TableInfo {
            columns: columns
                .iter()
                .map(|(n, t, max, nullable, auto)| ColumnInfo {
                    name: n.to_string(),
                    data_type: t.to_string(),
                    max_length: *max,
                    nullable: *nullable,
                    auto_increment: *auto,
                })
                .collect(),
            primary_key: primary_key.iter().map(|s| s.to_string()).collect(),
        };
        self.tables.lock().unwrap().insert(
            name.to_string(),
            MemTable {
                info,
                rows: Vec::new(),
                next_id: 1,
            },
        );
    }

    pub fn seed(&self, name: &str, row: Row) {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(name).expect("seeded table exists");
        table.push(row);
    }

    pub fn fail_upserts_where(&self, table: &str, column: &str, value: Value) {
        self.fail_rules.lock().unwrap().push(FailRule {
            table: table.to_string(),
            column: column.to_string(),
            value,
        });
    }

    /// Overwrite `column` on the rows of `name` matching `filters`.
    pub fn set_where(&self, name: &str, filters: &[(&str, Value)], column: &str, value: Value) {
        let filters: Row = filters.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(name).expect("table exists");
        for row in table.rows.iter_mut().filter(|r| MemTable::matches(r, &filters)) {
            row.insert(column.to_string(), value.clone());
        }
    }

    pub fn rows(&self, name: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(name)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Rows of `name` matching every `(column, value)` pair.
    pub fn rows_where(&self, name: &str, filters: &[(&str, Value)]) -> Vec<Row> {
        let filters: Row = filters.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        self.rows(name)
            .into_iter()
            .filter(|r| MemTable::matches(r, &filters))
            .collect()
    }
}

#[async_trait]
impl CatalogTarget for MemoryCatalog {
    async fn describe_table(&self, table: &str) -> Result<Option<TableInfo>> {
        Ok(self.tables.lock().unwrap().get(table).map(|t| t.info.clone()))
    }

    async fn select_ids(&self, table: &str, id_column: &str, filters: &Row) -> Result<Vec<i64>> {
        let tables = self.tables.lock().unwrap();
        let t = tables
            .get(table)
            .ok_or_else(|| anyhow!("relation \"{table}\" does not exist"))?;
        let mut ids: Vec<i64> = t
            .rows
            .iter()
            .filter(|r| MemTable::matches(r, filters))
            .filter_map(|r| r.get(id_column).and_then(Value::as_i64))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn insert(&self, table: &str, row: &Row, returning: Option<&str>) -> Result<Option<i64>> {
        let mut tables = self.tables.lock().unwrap();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("relation \"{table}\" does not exist"))?;
        t.check_columns(table, row)?;
        let id = t.push(row.clone());
        Ok(match returning {
            Some(col) => t
                .rows
                .last()
                .and_then(|r| r.get(col))
                .and_then(Value::as_i64)
                .or(id),
            None => None,
        })
    }

    async fn update(&self, table: &str, set: &Row, filters: &Row) -> Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("relation \"{table}\" does not exist"))?;
        t.check_columns(table, set)?;
        let mut n = 0;
        for row in t.rows.iter_mut().filter(|r| MemTable::matches(r, filters)) {
            for (k, v) in set {
                row.insert(k.clone(), v.clone());
            }
            n += 1;
        }
        Ok(n)
    }

    async fn upsert(&self, table: &str, row: &Row, keys: &[String]) -> Result<()> {
        for rule in self.fail_rules.lock().unwrap().iter() {
            if rule.table == table && row.get(&rule.column).is_some_and(|v| same(v, &rule.value)) {
                bail!("injected failure on {table} where {} = {}", rule.column, rule.value);
            }
        }
        let mut tables = self.tables.lock().unwrap();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("relation \"{table}\" does not exist"))?;
        t.check_columns(table, row)?;
        let key_filter: Row = keys
            .iter()
            .map(|k| (k.clone(), row.get(k).cloned().unwrap_or(Value::Null)))
            .collect();
        if let Some(existing) = t.rows.iter_mut().find(|r| MemTable::matches(r, &key_filter)) {
            for (k, v) in row.iter().filter(|(k, _)| updatable(k, keys)) {
                existing.insert(k.clone(), v.clone());
            }
            return Ok(());
        }
        t.push(row.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub mappings: Mutex<Vec<VersionedMapping>>,
    pub legacy: Mutex<BTreeMap<(String, String), Value>>,
    pub table_rows: Mutex<Vec<(String, StoredTableRow)>>,
    pub runs: Mutex<BTreeMap<i64, RunRecord>>,
    pub outcomes: Mutex<BTreeMap<i64, RunOutcome>>,
    pub errors: Mutex<Vec<ErrorLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_legacy(&self, catalog_key: &str, category: &str, mapping: Value) {
        self.legacy
            .lock()
            .unwrap()
            .insert((catalog_key.to_string(), category.to_string()), mapping);
    }

    pub fn add_table_settings(&self, catalog_key: &str, table: &str, settings: Value, overrides: Value) {
        self.table_rows.lock().unwrap().push((
            catalog_key.to_string(),
            StoredTableRow {
                table_name: table.to_string(),
                settings,
                field_overrides: overrides,
            },
        ));
    }

    pub fn add_run(&self, id: i64, catalog_key: &str, category: &str, record: Value) {
        self.runs.lock().unwrap().insert(
            id,
            RunRecord {
                id,
                catalog_key: catalog_key.to_string(),
                category: category.to_string(),
                mapping_version: None,
                record,
                entity_id: None,
                success: None,
                error: None,
                created_at: Utc::now(),
                updated_at: None,
            },
        );
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn latest_mapping(&self, catalog_key: &str, category: &str) -> Result<Option<VersionedMapping>> {
        Ok(self
            .mappings
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.catalog_key == catalog_key && m.category == category)
            .max_by_key(|m| m.version)
            .cloned())
    }

    async fn mapping_version(
        &self,
        catalog_key: &str,
        category: &str,
        version: i32,
    ) -> Result<Option<VersionedMapping>> {
        Ok(self
            .mappings
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.catalog_key == catalog_key && m.category == category && m.version == version)
            .cloned())
    }

    async fn legacy_mapping(&self, catalog_key: &str, category: &str) -> Result<Option<Value>> {
        Ok(self
            .legacy
            .lock()
            .unwrap()
            .get(&(catalog_key.to_string(), category.to_string()))
            .cloned())
    }

    async fn save_mapping(&self, catalog_key: &str, category: &str, mapping: &Value) -> Result<i32> {
        let mut mappings = self.mappings.lock().unwrap();
        let version = mappings
            .iter()
            .filter(|m| m.catalog_key == catalog_key && m.category == category)
            .map(|m| m.version)
            .max()
            .unwrap_or(0)
            + 1;
        mappings.push(VersionedMapping {
            catalog_key: catalog_key.to_string(),
            category: category.to_string(),
            version,
            mapping: mapping.clone(),
            created_at: Utc::now(),
        });
        Ok(version)
    }

    async fn table_settings(&self, catalog_key: &str) -> Result<Vec<StoredTableRow>> {
        Ok(self
            .table_rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key == catalog_key)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn load_run(&self, run_id: i64) -> Result<Option<RunRecord>> {
        Ok(self.runs.lock().unwrap().get(&run_id).cloned())
    }

    async fn finish_run(&self, run_id: i64, outcome: &RunOutcome) -> Result<()> {
        self.outcomes.lock().unwrap().insert(run_id, outcome.clone());
        Ok(())
    }

    async fn append_errors(&self, entries: &[ErrorLogEntry]) -> Result<()> {
        self.errors.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }
}

/// Serves canned bodies by URL; anything else is a 404.
#[derive(Default)]
pub struct FakeFetcher {
    bodies: Mutex<BTreeMap<String, (Option<String>, Bytes)>>,
    pub requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, content_type: Option<&str>, body: &[u8]) {
        self.bodies.lock().unwrap().insert(
            url.to_string(),
            (content_type.map(str::to_string), Bytes::copy_from_slice(body)),
        );
    }
}

#[async_trait]
impl AssetFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        self.requests.lock().unwrap().push(url.to_string());
        let bodies = self.bodies.lock().unwrap();
        let (content_type, body) = bodies
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("HTTP status client error (404 Not Found) for url ({url})"))?;
        Ok(Fetched {
            url: url.to_string(),
            content_type,
            body,
        })
    }
}
