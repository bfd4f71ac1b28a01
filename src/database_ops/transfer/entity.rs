//! Find-or-create of the primary catalog entity and its scalar columns.

use anyhow::anyhow;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use super::audit::{Failure, OpKind};
use super::context::RunContext;
use super::error::{SyncError, SyncResult};
use super::rows::{row_of, stamp};
use super::scope::{ENTITY, ENTITY_ID, ENTITY_LANG};
use crate::database_ops::target::{select_first_id, Row};
use crate::normalization::field_spec::{render, FieldSpec, PathRef, Source};

/// Well-known record keys tried for unmapped entity columns unless the mapping is strict.
const LEGACY_ENTITY_KEYS: [(&str, &[&str]); 7] = [
    ("reference", &["reference", "sku"]),
    ("price", &["price"]),
    ("ean13", &["ean13", "ean", "gtin13"]),
    ("upc", &["upc"]),
    ("mpn", &["mpn"]),
    ("weight", &["weight"]),
    ("wholesale_price", &["wholesale_price"]),
];

pub const LEGACY_NAME_KEYS: &[&str] = &["name", "title"];

#[derive(Debug, Clone)]
pub struct EntityOutcome {
    pub id: i64,
    pub created: bool,
    /// What was resolved for the entity row, for the run record.
    pub scalars: Row,
}

/// First non-empty value among well-known record keys.
pub fn legacy_value(src: &Source<'_>, keys: &[&str]) -> Option<Value> {
    FieldSpec::Alternatives(keys.iter().map(|k| FieldSpec::Path(PathRef::parse(k))).collect()).resolve(src)
}

/// The entity's display name in the default language (used for lookups).
pub fn resolve_name(ctx: &RunContext<'_>) -> Option<String> {
    let src = ctx.source();
    let fields = ctx.scope.fields_for(ENTITY_LANG);
    fields
        .get("name")
        .and_then(|spec| spec.resolve_string(&src))
        .or_else(|| {
            if ctx.scope.mapping.flags.strict_mapping_only {
                None
            } else {
                legacy_value(&src, LEGACY_NAME_KEYS)
                    .map(|v| render(&v))
                    .filter(|s| !s.trim().is_empty())
            }
        })
}

async fn resolve_scalars(ctx: &RunContext<'_>, table: &str) -> Row {
    let src = ctx.source();
    let fields = ctx.scope.fields_for(ENTITY);
    let mut out = Row::new();
    for (col, spec) in &fields {
        if col == ENTITY_ID || !ctx.schema.column_exists(table, col).await {
            continue;
        }
        if let Some(v) = spec.resolve(&src).filter(|v| !v.is_null()) {
            out.insert(col.clone(), v);
        }
    }
    if !ctx.scope.mapping.flags.strict_mapping_only {
        for (col, keys) in LEGACY_ENTITY_KEYS {
            if fields.contains_key(col) || out.contains_key(col) {
                continue;
            }
            if !ctx.schema.column_exists(table, col).await {
                continue;
            }
            if let Some(v) = legacy_value(&src, keys) {
                debug!(column = col, "entity column filled by legacy heuristic");
                out.insert(col.to_string(), v);
            }
        }
    }
    out
}

async fn locate(
    ctx: &RunContext<'_>,
    table: &str,
    scalars: &Row,
    name: Option<&str>,
    forced_id: Option<i64>,
) -> SyncResult<Option<i64>> {
    let target = ctx.target();
    if let Some(id) = forced_id {
        let found = select_first_id(target, table, ENTITY_ID, &row_of([(ENTITY_ID, json!(id))]))
            .await
            .map_err(SyncError::Target)?;
        return match found {
            Some(id) => Ok(Some(id)),
            None => Err(SyncError::EntityNotFound(id)),
        };
    }

    if let Some(reference) = scalars
        .get("reference")
        .map(render)
        .filter(|r| !r.trim().is_empty())
    {
        let found = select_first_id(target, table, ENTITY_ID, &row_of([("reference", Value::String(reference))]))
            .await
            .map_err(SyncError::Target)?;
        return Ok(found);
    }

    let lang_table = ctx.table(ENTITY_LANG);
    match (name, ctx.scope.id_lang_default) {
        (Some(name), Some(id_lang)) if ctx.schema.table_exists(&lang_table).await => {
            let filters = row_of([("name", json!(name)), ("id_lang", json!(id_lang))]);
            select_first_id(target, &lang_table, ENTITY_ID, &filters)
                .await
                .map_err(SyncError::Target)
        }
        _ => Ok(None),
    }
}

/// Locate (forced id → business key → name in the default language) and write the
/// entity. Updates touch only mapped columns; inserts also carry the mapping defaults.
#[instrument(skip(ctx), fields(table = tracing::field::Empty))]
pub async fn upsert_entity(ctx: &mut RunContext<'_>, forced_id: Option<i64>) -> SyncResult<EntityOutcome> {
    let table = ctx.table(ENTITY);
    tracing::Span::current().record("table", table.as_str());
    if !ctx.schema.table_exists(&table).await {
        return Err(SyncError::Target(anyhow!("entity table {table} is not visible on the target")));
    }

    let scalars = resolve_scalars(ctx, &table).await;
    let scalars = ctx.prepare(&table, scalars).await;
    let name = resolve_name(ctx);
    let existing = locate(ctx, &table, &scalars, name.as_deref(), forced_id).await?;

    let outcome = match existing {
        Some(id) => {
            ctx.set_entity(id);
            let mut set = scalars.clone();
            stamp(ctx.schema, &table, &mut set, false).await;
            if !set.is_empty() {
                let filters = row_of([(ENTITY_ID, json!(id))]);
                if let Err(e) = ctx.target().update(&table, &set, &filters).await {
                    ctx.fail(Failure::new(&table, OpKind::Update, e).entity(Some(id)).payload(&set));
                }
            }
            info!(id, "entity updated");
            EntityOutcome {
                id,
                created: false,
                scalars,
            }
        }
        None => {
            let mut row: Row = ctx
                .scope
                .defaults_for(ENTITY)
                .into_iter()
                .filter(|(col, _)| !scalars.contains_key(col) && col != ENTITY_ID)
                .collect();
            row.extend(scalars.iter().map(|(k, v)| (k.clone(), v.clone())));
            if let Some(shop) = ctx.scope.id_shop_default {
                if !row.contains_key("id_shop_default") && ctx.schema.column_exists(&table, "id_shop_default").await {
                    row.insert("id_shop_default".into(), json!(shop));
                }
            }
            stamp(ctx.schema, &table, &mut row, true).await;
            let row = ctx.prepare(&table, row).await;
            let id = ctx
                .target()
                .insert(&table, &row, Some(ENTITY_ID))
                .await
                .map_err(SyncError::Target)?
                .ok_or_else(|| SyncError::Target(anyhow!("insert into {table} returned no id")))?;
            ctx.set_entity(id);
            info!(id, "entity created");
            EntityOutcome {
                id,
                created: true,
                scalars,
            }
        }
    };

    let mut outcome = outcome;
    if let Some(name) = name {
        outcome.scalars.insert("name".into(), Value::String(name));
    }
    Ok(outcome)
}
