//! Plain-text dump of how the target catalog looks to the transfer: columns, the category
//! each column is coerced as, length limits and primary keys.
use std::fmt::Write as _;

use anyhow::Result;
use tracing::instrument;

use super::schema_cache::{category_of, ColumnCategory};
use super::target::{CatalogTarget, TableInfo};
use crate::database_ops::transfer::mapping::strip_prefix;

fn category_label(c: ColumnCategory) -> &'static str {
    match c {
        ColumnCategory::Numeric => "numeric",
        ColumnCategory::Date => "date",
        ColumnCategory::Text => "text",
    }
}

pub fn render_table(out: &mut String, table: &str, info: Option<&TableInfo>) {
    let Some(info) = info else {
        writeln!(out, "\n=== {table} ===\n  (missing: not visible on this connection)").ok();
        return;
    };
    writeln!(out, "\n=== {table} ===").ok();
    writeln!(out, "Columns (name:type:category:null):").ok();
    for col in &info.columns {
        let mut line = format!(
            "  {}:{}:{}:{}",
            col.name,
            col.data_type,
            category_label(category_of(&col.data_type)),
            if col.nullable { "null" } else { "not-null" }
        );
        if let Some(max) = col.max_length {
            write!(line, " max={max}").ok();
        }
        if col.auto_increment {
            line.push_str(" auto");
        }
        writeln!(out, "{line}").ok();
    }
    if info.primary_key.is_empty() {
        writeln!(out, "Primary Key: (none)").ok();
    } else {
        writeln!(out, "Primary Key: ({})", info.primary_key.join(", ")).ok();
    }
}

/// Describe `tables` (bare names get `prefix`) and return the report.
#[instrument(skip(target))]
pub async fn inspect_tables(target: &dyn CatalogTarget, tables: &[String], prefix: &str) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "SCHEMA ({prefix}*): {} table(s)", tables.len()).ok();
    for table in tables {
        let name = if strip_prefix(table, prefix) == table.as_str() {
            format!("{prefix}{table}")
        } else {
            table.clone()
        };
        let info = target.describe_table(&name).await?;
        render_table(&mut out, &name, info.as_ref());
    }
    Ok(out)
}
