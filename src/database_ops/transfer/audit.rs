//! Append-only record of everything that went wrong (or was silently adjusted) during a
//! run. Writers never abort on a row failure; they hand it to the sink and move on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Update,
    Upsert,
    Truncate,
    SkipMissingPk,
    /// A pipeline-level step (download, signature check, ...).
    Pipeline(String),
}

impl OpKind {
    pub fn as_str(&self) -> &str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Upsert => "upsert",
            OpKind::Truncate => "truncate",
            OpKind::SkipMissingPk => "skip_missing_pk",
            OpKind::Pipeline(name) => name,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed or adjusted operation.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub table: String,
    pub op: OpKind,
    pub id_entity: Option<i64>,
    pub id_shop: Option<i64>,
    pub id_lang: Option<i64>,
    pub message: String,
    pub payload: Value,
}

impl Failure {
    pub fn new(table: impl Into<String>, op: OpKind, message: impl fmt::Display) -> Self {
        Self {
            table: table.into(),
            op,
            id_entity: None,
            id_shop: None,
            id_lang: None,
            message: message.to_string(),
            payload: Value::Null,
        }
    }

    pub fn entity(mut self, id: Option<i64>) -> Self {
        self.id_entity = id;
        self
    }

    pub fn shop(mut self, id: Option<i64>) -> Self {
        self.id_shop = id;
        self
    }

    pub fn lang(mut self, id: Option<i64>) -> Self {
        self.id_lang = id;
        self
    }

    pub fn payload(mut self, payload: impl Serialize) -> Self {
        self.payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorLogEntry {
    pub run_id: Option<i64>,
    pub catalog_key: String,
    pub category: String,
    #[serde(flatten)]
    pub failure: Failure,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AuditSink {
    run_id: Option<i64>,
    catalog_key: String,
    category: String,
    entries: Vec<ErrorLogEntry>,
}

impl AuditSink {
    pub fn new(run_id: Option<i64>, catalog_key: &str, category: &str) -> Self {
        Self {
            run_id,
            catalog_key: catalog_key.to_string(),
            category: category.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, failure: Failure) {
        if failure.op == OpKind::Truncate {
            info!(table = %failure.table, payload = %failure.payload, "value truncated to column length");
        } else {
            warn!(
                table = %failure.table,
                op = %failure.op,
                id_entity = ?failure.id_entity,
                id_shop = ?failure.id_shop,
                id_lang = ?failure.id_lang,
                error = %failure.message,
                "transfer operation failed"
            );
        }
        self.entries.push(ErrorLogEntry {
            run_id: self.run_id,
            catalog_key: self.catalog_key.clone(),
            category: self.category.clone(),
            failure,
            created_at: Utc::now(),
        });
    }

    /// The single collection point for row-level results.
    pub fn collect<T>(&mut self, result: Result<T, Failure>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(f) => {
                self.record(f);
                None
            }
        }
    }

    pub fn entries(&self) -> &[ErrorLogEntry] {
        &self.entries
    }

    /// Entries that represent failures (truncations are informational).
    pub fn failure_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.failure.op != OpKind::Truncate)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
