//! Schema-aware writer for any extra table named by the mapping or the stored settings.
//!
//! Rows are built per (shop × language × group) combination, limited to the axes the table
//! actually has. Keys come from the `keys` setting or the table's primary key; a row without
//! a complete key is skipped and logged. The one exception is the run's designated base
//! table: its generated key is expected to be missing before insert, and the id the target
//! hands back is kept for the rest of the run.

use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::audit::{Failure, OpKind};
use super::context::RunContext;
use super::entity::EntityOutcome;
use super::error::{SyncError, SyncResult};
use super::mapping::{strip_prefix, HELPER_KEYS};
use super::rows::now_stamp;
use super::scope::{EffectiveTable, CORE_TABLES};
use super::variants::VARIANT_TABLES;
use crate::database_ops::target::{select_first_id, Row, TableInfo};
use crate::normalization::field_spec::is_empty;

#[derive(Debug, Clone, Copy, Default)]
struct Axes {
    shop: Option<i64>,
    lang: Option<i64>,
    group: Option<i64>,
}

/// Generated key of the designated base table: a single auto-increment primary key that
/// the mapping does not key on explicitly. Every other table yields `None`.
fn base_key(info: &TableInfo, table: &EffectiveTable, designated: bool) -> Option<String> {
    if !designated {
        return None;
    }
    match info.primary_key.as_slice() {
        [pk] if info.column(pk).is_some_and(|c| c.auto_increment) => match &table.settings.keys {
            None => Some(pk.clone()),
            Some(keys) if keys.len() == 1 && &keys[0] == pk => Some(pk.clone()),
            Some(_) => None,
        },
        _ => None,
    }
}

fn axis_values(has: bool, ids: Vec<i64>) -> Vec<Option<i64>> {
    if has {
        ids.into_iter().map(Some).collect()
    } else {
        vec![None]
    }
}

fn build_row(ctx: &RunContext<'_>, table: &EffectiveTable, info: &TableInfo, axes: Axes) -> Row {
    let src = ctx.source();
    // merged defaults first; field specs only for columns they leave uncovered
    let mut row: Row = table
        .defaults
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (col, spec) in &table.fields {
        if row.contains_key(col) {
            continue;
        }
        if let Some(v) = spec.resolve(&src).filter(|v| !v.is_null()) {
            row.insert(col.clone(), v);
        }
    }
    for (col, v) in &table.settings.fixed {
        if !HELPER_KEYS.contains(&col.as_str()) {
            row.insert(col.clone(), v.clone());
        }
    }
    for (col, id) in [("id_shop", axes.shop), ("id_lang", axes.lang), ("id_group", axes.group)] {
        if let Some(id) = id {
            row.insert(col.to_string(), json!(id));
        }
    }
    // owner and generated ids backfill
    for (col, id) in &ctx.generated_ids {
        if info.has_column(col) && row.get(col).map_or(true, Value::is_null) {
            row.insert(col.clone(), json!(id));
        }
    }
    for col in ["date_add", "date_upd"] {
        if info.has_column(col) && !row.contains_key(col) {
            row.insert(col.to_string(), now_stamp());
        }
    }
    row
}

fn missing_keys(row: &Row, keys: &[String]) -> Vec<String> {
    keys.iter()
        .filter(|k| row.get(*k).map_or(true, is_empty))
        .cloned()
        .collect()
}

/// Insert (or find via the `lookup` setting) a base-table row. Returns the id and whether
/// the row was inserted.
async fn write_base_row(
    ctx: &mut RunContext<'_>,
    table: &EffectiveTable,
    pk: &str,
    row: Row,
) -> Result<(i64, bool), Failure> {
    let name = table.name.as_str();
    let row = ctx.prepare(name, row).await;
    if let Some(lookup) = &table.settings.lookup {
        let filters: Row = lookup
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
            .collect();
        if filters.len() == lookup.len() {
            let found = select_first_id(ctx.target(), name, pk, &filters)
                .await
                .map_err(|e| Failure::new(name, OpKind::Upsert, e).payload(&filters))?;
            if let Some(id) = found {
                let mut keyed = row.clone();
                keyed.insert(pk.to_string(), json!(id));
                ctx.target()
                    .upsert(name, &keyed, &[pk.to_string()])
                    .await
                    .map_err(|e| Failure::new(name, OpKind::Upsert, e).payload(&keyed))?;
                return Ok((id, false));
            }
        } else {
            debug!(table = name, ?lookup, "lookup columns unresolved; inserting");
        }
    }
    ctx.target()
        .insert(name, &row, Some(pk))
        .await
        .map_err(|e| Failure::new(name, OpKind::Insert, e).payload(&row))?
        .ok_or_else(|| Failure::new(name, OpKind::Insert, "insert returned no id").payload(&row))
        .map(|id| (id, true))
}

async fn write_table(ctx: &mut RunContext<'_>, table: &EffectiveTable, info: &TableInfo) -> usize {
    let name = table.name.as_str();
    let scope = ctx.scope;
    let shops = axis_values(info.has_column("id_shop"), scope.shops_for(&table.bare));
    let langs = axis_values(info.has_column("id_lang"), scope.langs_for(&table.bare));
    let groups = axis_values(info.has_column("id_group"), scope.groups_for(&table.bare));
    if shops.is_empty() || langs.is_empty() || groups.is_empty() {
        debug!(table = name, "an axis resolved to no ids; nothing to write");
        return 0;
    }

    let base_pk = base_key(info, table, scope.is_base(&table.bare));
    let keys: Vec<String> = table
        .settings
        .keys
        .clone()
        .unwrap_or_else(|| info.primary_key.clone());

    let mut written = 0usize;
    for &shop in &shops {
        for &lang in &langs {
            for &group in &groups {
                let axes = Axes { shop, lang, group };
                let row = build_row(ctx, table, info, axes);
                let missing = missing_keys(&row, &keys);

                if let Some(pk) = base_pk.as_deref().filter(|pk| missing.iter().any(|m| m == pk)) {
                    let result = write_base_row(ctx, table, pk, row).await;
                    if let Some((id, created)) = ctx.collect(result.map_err(|f| f.shop(shop).lang(lang))) {
                        debug!(table = name, column = pk, id, created, "captured generated id");
                        ctx.generated_ids.insert(pk.to_string(), id);
                        ctx.base_created |= created;
                        written += 1;
                    }
                    continue;
                }

                if keys.is_empty() || !missing.is_empty() {
                    ctx.fail(
                        Failure::new(
                            name,
                            OpKind::SkipMissingPk,
                            format!("no value for key column(s) {missing:?}"),
                        )
                        .shop(shop)
                        .lang(lang)
                        .payload(&row),
                    );
                    continue;
                }

                let row = ctx.prepare(name, row).await;
                match ctx.target().upsert(name, &row, &keys).await {
                    Ok(()) => written += 1,
                    Err(e) => ctx.fail(
                        Failure::new(name, OpKind::Upsert, e)
                            .shop(shop)
                            .lang(lang)
                            .payload(&row),
                    ),
                }
            }
        }
    }
    written
}

/// Write every non-core table in the effective configuration; `allow` narrows the set
/// (bare or prefixed names).
#[instrument(skip(ctx, allow))]
pub async fn write_generic_tables(ctx: &mut RunContext<'_>, allow: Option<&[String]>) -> usize {
    let scope = ctx.scope;
    let mut candidates: Vec<(&EffectiveTable, std::sync::Arc<TableInfo>)> = Vec::new();
    for table in scope.tables.values() {
        let bare = table.bare.as_str();
        if CORE_TABLES.contains(&bare) || VARIANT_TABLES.contains(&bare) {
            continue;
        }
        if let Some(allow) = allow {
            if !allow.iter().any(|a| a == bare || *a == table.name) {
                continue;
            }
        }
        match ctx.schema.table(&table.name).await {
            Some(info) => candidates.push((table, info)),
            None => warn!(table = %table.name, "mapped table not found on target; skipped"),
        }
    }
    // the base table first so its id is available to the rest
    candidates.sort_by_key(|(t, info)| base_key(info, t, scope.is_base(&t.bare)).is_none());

    let mut total = 0usize;
    for (table, info) in candidates {
        let n = write_table(ctx, table, &info).await;
        debug!(table = %table.name, rows = n, "generic table written");
        total += n;
    }
    info!(rows = total, "generic tables written");
    total
}

/// A non-product entity kind. Its base table is written alone first; the satellites
/// (`allow` narrows them further) then backfill the captured id.
#[instrument(skip(ctx, allow))]
pub async fn write_secondary_entity(
    ctx: &mut RunContext<'_>,
    base: &str,
    allow: Option<&[String]>,
    forced_id: Option<i64>,
) -> SyncResult<EntityOutcome> {
    let scope = ctx.scope;
    let name = scope.table_name(base);
    let pk = match (scope.table(base), ctx.schema.table(&name).await) {
        (Some(table), Some(info)) => base_key(&info, table, true),
        _ => None,
    }
    .ok_or_else(|| SyncError::EntityTableUnusable(name.clone()))?;

    if let Some(id) = forced_id {
        let mut filters = Row::new();
        filters.insert(pk.clone(), json!(id));
        let found = select_first_id(ctx.target(), &name, &pk, &filters)
            .await
            .map_err(SyncError::Target)?;
        if found.is_none() {
            return Err(SyncError::EntityNotFound(id));
        }
        ctx.generated_ids.insert(pk.clone(), id);
    }

    let only = [base.to_string()];
    write_generic_tables(ctx, Some(only.as_slice())).await;
    let id = ctx
        .generated_ids
        .get(&pk)
        .copied()
        .ok_or_else(|| SyncError::EntityRowMissing(name.clone()))?;
    ctx.entity_id = Some(id);
    info!(table = %name, id, created = ctx.base_created, "entity row written");

    let satellites: Vec<String> = scope
        .entity_satellites(base)
        .into_iter()
        .skip(1)
        .filter(|t| allow.map_or(true, |a| a.iter().any(|n| strip_prefix(n, &scope.prefix) == t.as_str())))
        .collect();
    if !satellites.is_empty() {
        write_generic_tables(ctx, Some(satellites.as_slice())).await;
    }
    Ok(EntityOutcome {
        id,
        created: ctx.base_created,
        scalars: Row::new(),
    })
}
