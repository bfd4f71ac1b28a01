//! Row shaping shared by every writer: unknown columns are dropped, blanks coerced by
//! column category, and over-long strings clamped (with an audit note).

use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use super::audit::{AuditSink, Failure, OpKind};
use crate::database_ops::schema_cache::{ColumnCategory, SchemaCache};
use crate::database_ops::target::Row;
use crate::normalization::field_spec::{is_empty, render};
use crate::normalization::numeric::{as_id, coerce_number, number_value};
use crate::normalization::text::clamp_to_chars;

pub fn now_stamp() -> Value {
    Value::String(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Build a row from `(column, value)` pairs.
pub fn row_of<I, K>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

fn coerce(category: ColumnCategory, nullable: bool, is_boolean: bool, value: Value) -> Value {
    match category {
        ColumnCategory::Numeric => {
            if value.is_null() && nullable {
                return Value::Null;
            }
            match value {
                Value::Bool(b) if is_boolean => Value::Bool(b),
                Value::Number(_) => value,
                other => number_value(coerce_number(&other)),
            }
        }
        ColumnCategory::Date => {
            if is_empty(&value) {
                Value::Null
            } else {
                value
            }
        }
        ColumnCategory::Text => match value {
            Value::Null => Value::Null,
            Value::String(_) | Value::Object(_) | Value::Array(_) => value,
            other => Value::String(render(&other)),
        },
    }
}

/// Shape `row` for `table`: the returned row only holds columns the table has.
pub async fn prepare_row(schema: &SchemaCache<'_>, table: &str, row: Row, audit: &mut AuditSink) -> Row {
    if !schema.table_exists(table).await {
        return Row::new();
    }
    let owner = |k: &str| row.get(k).and_then(as_id);
    let (id_entity, id_shop, id_lang) = (owner("id_product"), owner("id_shop"), owner("id_lang"));
    let mut out = Row::with_capacity(row.len());
    for (col, value) in row {
        let Some(ty) = schema.column_type(table, &col).await else {
            debug!(table, column = %col, "column not in target; omitted");
            continue;
        };
        let mut value = coerce(ty.category, ty.nullable, ty.boolean, value);

        let max = schema.column_max_length(table, &col).await;
        if let Value::String(s) = &value {
            let before_len = s.chars().count();
            if max > 0 && before_len > max {
                let clamped = clamp_to_chars(s, max);
                let after_len = clamped.chars().count();
                audit.record(
                    Failure::new(
                        table,
                        OpKind::Truncate,
                        format!("{col} truncated: {before_len} > {after_len} = {max} chars"),
                    )
                    .entity(id_entity)
                    .shop(id_shop)
                    .lang(id_lang)
                    .payload(json!({
                        "column": col,
                        "before_len": before_len,
                        "after_len": after_len,
                        "max_len": max,
                    })),
                );
                value = Value::String(clamped);
            }
        }
        out.insert(col, value);
    }
    out
}

/// Fill `date_add`/`date_upd` when the table has them and the row does not.
pub async fn stamp(schema: &SchemaCache<'_>, table: &str, row: &mut Row, created: bool) {
    let now = now_stamp();
    if created && !row.contains_key("date_add") && schema.column_exists(table, "date_add").await {
        row.insert("date_add".into(), now.clone());
    }
    if !row.contains_key("date_upd") && schema.column_exists(table, "date_upd").await {
        row.insert("date_upd".into(), now);
    }
}
