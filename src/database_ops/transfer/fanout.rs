//! Dependent rows of the entity that exist once per shop or per language, plus the base
//! stock row per shop.

use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use super::audit::{Failure, OpKind};
use super::context::RunContext;
use super::entity::{legacy_value, resolve_name};
use super::mapping::Defaults;
use super::precedence::Precedence;
use super::rows::{row_of, stamp};
use super::scope::{ENTITY, ENTITY_ID, ENTITY_LANG, ENTITY_SHOP, STOCK};
use crate::database_ops::target::{select_first_id, Row};
use crate::normalization::field_spec::{render, Source};
use crate::normalization::text::slugify;

/// Columns the per-shop row always considers, mapped or not.
const SHOP_COLUMNS: [&str; 11] = [
    "price",
    "wholesale_price",
    "active",
    "visibility",
    "condition",
    "available_for_order",
    "show_price",
    "id_tax_rules_group",
    "id_category_default",
    "on_sale",
    "minimal_quantity",
];

const LANG_COLUMNS: [&str; 9] = [
    "name",
    "description",
    "description_short",
    "meta_title",
    "meta_description",
    "meta_keywords",
    "link_rewrite",
    "available_now",
    "available_later",
];

const LEGACY_LANG_KEYS: [(&str, &[&str]); 3] = [
    ("description", &["description", "description_html"]),
    ("description_short", &["description_short", "short_description", "summary"]),
    ("meta_description", &["meta_description"]),
];

fn literal_fallback(col: &str) -> Option<Value> {
    match col {
        "visibility" => Some(json!("both")),
        "condition" => Some(json!("new")),
        _ => None,
    }
}

/// Per-shop defaults: shop-table settings, then shop-table mapping defaults, then the
/// entity defaults, then the literal fallback.
fn shop_default(ctx: &RunContext<'_>, col: &str, shop_defaults: &Defaults, entity_defaults: &Defaults) -> Option<Value> {
    let settings = ctx.scope.settings(ENTITY_SHOP);
    Precedence::new("shop default")
        .or(
            "shop settings",
            settings.and_then(|s| s.fixed.get(col).or_else(|| s.defaults.get(col)).cloned()),
        )
        .or("shop defaults", shop_defaults.get(col).cloned())
        .or("entity defaults", entity_defaults.get(col).cloned())
        .or_else("fallback", || literal_fallback(col))
        .resolve()
}

fn resolved(src: &Source<'_>, ctx: &RunContext<'_>, bare: &str, col: &str) -> Option<Value> {
    ctx.scope
        .fields_for(bare)
        .get(col)
        .and_then(|spec| spec.resolve(src))
        .filter(|v| !v.is_null())
}

/// Known columns always; every other mapped column only with `unified_dynamic`.
fn mapped_columns(ctx: &RunContext<'_>, bare: &str, known: &[&str]) -> Vec<String> {
    let mut cols: Vec<String> = known.iter().map(|c| c.to_string()).collect();
    if ctx.scope.mapping.flags.unified_dynamic {
        if let Some(t) = ctx.scope.table(bare) {
            for col in t.fields.keys() {
                if !cols.contains(col) && col != ENTITY_ID && col != "id_shop" && col != "id_lang" {
                    cols.push(col.clone());
                }
            }
        }
    }
    cols
}

#[instrument(skip(ctx))]
pub async fn write_shop_rows(ctx: &mut RunContext<'_>, entity_id: i64) {
    let table = ctx.table(ENTITY_SHOP);
    if !ctx.schema.table_exists(&table).await {
        debug!(table, "no per-shop table");
        return;
    }
    let shops = ctx.scope.shops_for(ENTITY_SHOP);
    let src = ctx.source();
    let shop_defaults = ctx.scope.defaults_for(ENTITY_SHOP);
    let entity_defaults = ctx.scope.defaults_for(ENTITY);

    let mut base = Row::new();
    for col in mapped_columns(ctx, ENTITY_SHOP, &SHOP_COLUMNS) {
        let value = resolved(&src, ctx, ENTITY_SHOP, &col)
            .or_else(|| shop_default(ctx, &col, &shop_defaults, &entity_defaults));
        if let Some(v) = value {
            base.insert(col, v);
        }
    }
    if !ctx.scope.mapping.flags.strict_mapping_only && !base.contains_key("price") {
        if let Some(price) = legacy_value(&src, &["price"]) {
            base.insert("price".into(), price);
        }
    }

    let keys = vec![ENTITY_ID.to_string(), "id_shop".to_string()];
    let mut written = 0usize;
    for shop in shops {
        let mut row = row_of([(ENTITY_ID, json!(entity_id)), ("id_shop", json!(shop))]);
        row.extend(base.iter().map(|(k, v)| (k.clone(), v.clone())));
        stamp(ctx.schema, &table, &mut row, true).await;
        let row = ctx.prepare(&table, row).await;
        match ctx.target().upsert(&table, &row, &keys).await {
            Ok(()) => written += 1,
            Err(e) => ctx.fail(
                Failure::new(&table, OpKind::Upsert, e)
                    .entity(Some(entity_id))
                    .shop(Some(shop))
                    .payload(&row),
            ),
        }
    }
    info!(table, written, "per-shop rows written");
}

fn lang_values(ctx: &RunContext<'_>) -> Row {
    let src = ctx.source();
    let defaults = ctx.scope.defaults_for(ENTITY_LANG);
    let mut out = Row::new();
    for col in mapped_columns(ctx, ENTITY_LANG, &LANG_COLUMNS) {
        if let Some(v) = resolved(&src, ctx, ENTITY_LANG, &col).or_else(|| defaults.get(&col).cloned()) {
            out.insert(col, v);
        }
    }
    if !out.contains_key("name") {
        if let Some(name) = resolve_name(ctx) {
            out.insert("name".into(), Value::String(name));
        }
    }
    if !ctx.scope.mapping.flags.strict_mapping_only {
        for (col, keys) in LEGACY_LANG_KEYS {
            if !out.contains_key(col) {
                if let Some(v) = legacy_value(&src, keys) {
                    out.insert(col.to_string(), v);
                }
            }
        }
    }
    let slug_missing = out
        .get("link_rewrite")
        .map(|v| render(v).trim().is_empty())
        .unwrap_or(true);
    if slug_missing {
        if let Some(name) = out.get("name").map(render) {
            out.insert("link_rewrite".into(), Value::String(slugify(&name)));
        }
    }
    out
}

/// One translated row per language. When the language table carries a shop column the
/// shop axis is the global shop list, never a per-table override.
#[instrument(skip(ctx))]
pub async fn write_lang_rows(ctx: &mut RunContext<'_>, entity_id: i64) {
    let table = ctx.table(ENTITY_LANG);
    if !ctx.schema.table_exists(&table).await {
        debug!(table, "no per-language table");
        return;
    }
    let values = lang_values(ctx);
    let langs = ctx.scope.langs_for(ENTITY_LANG);
    let shop_axis: Vec<Option<i64>> = if ctx.schema.column_exists(&table, "id_shop").await {
        ctx.scope.shops.iter().copied().map(Some).collect()
    } else {
        vec![None]
    };

    let mut keys = vec![ENTITY_ID.to_string()];
    if shop_axis.iter().any(Option::is_some) {
        keys.push("id_shop".into());
    }
    keys.push("id_lang".into());

    let mut written = 0usize;
    for shop in &shop_axis {
        for lang in &langs {
            let mut row = row_of([(ENTITY_ID, json!(entity_id))]);
            if let Some(shop) = shop {
                row.insert("id_shop".into(), json!(shop));
            }
            row.insert("id_lang".into(), json!(lang));
            row.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
            let row = ctx.prepare(&table, row).await;
            match ctx.target().upsert(&table, &row, &keys).await {
                Ok(()) => written += 1,
                Err(e) => ctx.fail(
                    Failure::new(&table, OpKind::Upsert, e)
                        .entity(Some(entity_id))
                        .shop(*shop)
                        .lang(Some(*lang))
                        .payload(&row),
                ),
            }
        }
    }
    info!(table, written, "per-language rows written");
}

/// Base stock row (`id_product_attribute = 0`) per shop. Quantity is set on creation and
/// only rewritten later when the mapping provides one.
#[instrument(skip(ctx))]
pub async fn write_stock_rows(ctx: &mut RunContext<'_>, entity_id: i64) {
    let table = ctx.table(STOCK);
    if !ctx.schema.table_exists(&table).await {
        debug!(table, "no stock table");
        return;
    }
    let src = ctx.source();
    let mapped_qty = resolved(&src, ctx, STOCK, "quantity");
    for shop in ctx.scope.shops_for(STOCK) {
        let outcome = ensure_stock_row(ctx, &table, entity_id, 0, shop, mapped_qty.clone()).await;
        ctx.collect(outcome);
    }
}

/// Create (or, with `quantity`, refresh) one stock row for `(entity, combination, shop)`.
pub async fn ensure_stock_row(
    ctx: &mut RunContext<'_>,
    table: &str,
    entity_id: i64,
    id_product_attribute: i64,
    shop: i64,
    quantity: Option<Value>,
) -> Result<(), Failure> {
    let mut lookup = row_of([
        (ENTITY_ID, json!(entity_id)),
        ("id_product_attribute", json!(id_product_attribute)),
        ("id_shop", json!(shop)),
    ]);
    if ctx.schema.column_exists(table, "id_shop_group").await {
        lookup.insert("id_shop_group".into(), json!(ctx.scope.mapping.id_shop_group.unwrap_or(0)));
    }
    let pk = ctx
        .schema
        .primary_key(table)
        .await
        .into_iter()
        .next()
        .unwrap_or_else(|| "id_stock_available".to_string());
    let fail = |op: OpKind, e: anyhow::Error, payload: &Row| {
        Failure::new(table, op, e)
            .entity(Some(entity_id))
            .shop(Some(shop))
            .payload(payload)
    };

    let existing = select_first_id(ctx.target(), table, &pk, &lookup)
        .await
        .map_err(|e| fail(OpKind::Upsert, e, &lookup))?;
    match existing {
        Some(id) => {
            if let Some(qty) = quantity {
                let set = ctx.prepare(table, row_of([("quantity", qty)])).await;
                ctx.target()
                    .update(table, &set, &row_of([(pk.as_str(), json!(id))]))
                    .await
                    .map_err(|e| fail(OpKind::Update, e, &set))?;
            }
        }
        None => {
            let mut row = lookup.clone();
            row.insert("quantity".into(), quantity.unwrap_or_else(|| json!(0)));
            for (col, v) in [("depends_on_stock", json!(0)), ("out_of_stock", json!(2))] {
                row.entry(col.to_string()).or_insert(v);
            }
            let row = ctx.prepare(table, row).await;
            ctx.target()
                .insert(table, &row, None)
                .await
                .map_err(|e| fail(OpKind::Insert, e, &row))?;
        }
    }
    Ok(())
}
