//! Attribute groups, attribute values and the entity's combinations.

use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use super::audit::{Failure, OpKind};
use super::context::RunContext;
use super::fanout::ensure_stock_row;
use super::mapping::FieldMap;
use super::rows::row_of;
use super::scope::{ENTITY, ENTITY_ID, ENTITY_SHOP, STOCK};
use crate::database_ops::target::{select_first_id, Row};
use crate::normalization::field_spec::{render, Source};

const GROUP: &str = "attribute_group";
const GROUP_LANG: &str = "attribute_group_lang";
const GROUP_SHOP: &str = "attribute_group_shop";
const VALUE: &str = "attribute";
const VALUE_LANG: &str = "attribute_lang";
const VALUE_SHOP: &str = "attribute_shop";
const COMBINATION: &str = "product_attribute";
const COMBINATION_SHOP: &str = "product_attribute_shop";
const COMBINATION_LINK: &str = "product_attribute_combination";

/// Tables owned by this writer.
pub const VARIANT_TABLES: [&str; 9] = [
    GROUP,
    GROUP_LANG,
    GROUP_SHOP,
    VALUE,
    VALUE_LANG,
    VALUE_SHOP,
    COMBINATION,
    COMBINATION_SHOP,
    COMBINATION_LINK,
];

const COLOR_GROUP_NAMES: [&str; 4] = ["color", "colour", "couleur", "farbe"];

fn is_color_group(name: &str) -> bool {
    COLOR_GROUP_NAMES.contains(&name.trim().to_lowercase().as_str())
}

/// Variant codes from the configured source: an array, or a comma-separated string.
/// Blank and repeated codes are dropped.
pub fn variant_values(value: Option<Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::Object(o) => o
                    .get("code")
                    .or_else(|| o.get("name"))
                    .map(render)
                    .unwrap_or_default(),
                other => render(other),
            })
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        Some(other) if !other.is_null() => vec![render(&other)],
        _ => Vec::new(),
    };
    let mut out: Vec<String> = Vec::new();
    for code in raw {
        let code = code.trim().to_string();
        if !code.is_empty() && !out.contains(&code) {
            out.push(code);
        }
    }
    out
}

fn variant_item(code: Option<&str>, index: usize, group: &str) -> Value {
    json!({"code": code, "index": index, "group": group})
}

fn resolve_fields(ctx: &RunContext<'_>, fields: &FieldMap, variant: &Value) -> Row {
    let src = Source::new(ctx.record).with_variant(variant);
    fields
        .iter()
        .filter(|(col, _)| !matches!(col.as_str(), ENTITY_ID | "id_shop" | "id_product_attribute" | "default_on"))
        .filter_map(|(col, spec)| spec.resolve(&src).filter(|v| !v.is_null()).map(|v| (col.clone(), v)))
        .collect()
}

fn table_fields(ctx: &RunContext<'_>, bare: &str) -> FieldMap {
    ctx.scope.table(bare).map(|t| t.fields.clone()).unwrap_or_default()
}

/// Translated rows for every language plus per-shop association rows.
async fn write_translations(
    ctx: &mut RunContext<'_>,
    id_column: &str,
    id: i64,
    lang_bare: &str,
    lang_values: &Row,
    shop_bare: &str,
) {
    let lang_table = ctx.table(lang_bare);
    for lang in ctx.scope.langs_for(lang_bare) {
        let mut row = row_of([(id_column, json!(id)), ("id_lang", json!(lang))]);
        row.extend(lang_values.iter().map(|(k, v)| (k.clone(), v.clone())));
        ctx.upsert_row(&lang_table, row, &[id_column, "id_lang"], None, Some(lang)).await;
    }
    let shop_table = ctx.table(shop_bare);
    for shop in ctx.scope.shops_for(shop_bare) {
        let row = row_of([(id_column, json!(id)), ("id_shop", json!(shop))]);
        ctx.upsert_row(&shop_table, row, &[id_column, "id_shop"], Some(shop), None).await;
    }
}

async fn ensure_group(ctx: &mut RunContext<'_>, name: &str, id_lang: i64) -> Result<i64, Failure> {
    let table = ctx.table(GROUP);
    let lang_table = ctx.table(GROUP_LANG);
    let lookup = row_of([("name", json!(name)), ("id_lang", json!(id_lang))]);
    let found = select_first_id(ctx.target(), &lang_table, "id_attribute_group", &lookup)
        .await
        .map_err(|e| Failure::new(&lang_table, OpKind::Upsert, e).payload(&lookup))?;
    if let Some(id) = found {
        return Ok(id);
    }

    let color = is_color_group(name);
    let row = row_of([
        ("is_color_group", json!(if color { 1 } else { 0 })),
        ("group_type", json!(if color { "color" } else { "select" })),
        ("position", json!(0)),
    ]);
    let row = ctx.prepare(&table, row).await;
    let id = ctx
        .target()
        .insert(&table, &row, Some("id_attribute_group"))
        .await
        .map_err(|e| Failure::new(&table, OpKind::Insert, e).payload(&row))?
        .ok_or_else(|| Failure::new(&table, OpKind::Insert, "insert returned no id"))?;
    info!(group = name, id, "attribute group created");
    let names = row_of([("name", json!(name)), ("public_name", json!(name))]);
    write_translations(ctx, "id_attribute_group", id, GROUP_LANG, &names, GROUP_SHOP).await;
    Ok(id)
}

async fn ensure_value(
    ctx: &mut RunContext<'_>,
    group_id: i64,
    color_group: bool,
    code: &str,
    index: usize,
    id_lang: i64,
) -> Result<i64, Failure> {
    let table = ctx.table(VALUE);
    let lang_table = ctx.table(VALUE_LANG);
    let lookup = row_of([("name", json!(code)), ("id_lang", json!(id_lang))]);
    let candidates = ctx
        .target()
        .select_ids(&lang_table, "id_attribute", &lookup)
        .await
        .map_err(|e| Failure::new(&lang_table, OpKind::Upsert, e).payload(&lookup))?;
    for candidate in candidates {
        let in_group = row_of([("id_attribute", json!(candidate)), ("id_attribute_group", json!(group_id))]);
        match select_first_id(ctx.target(), &table, "id_attribute", &in_group).await {
            Ok(Some(id)) => return Ok(id),
            Ok(None) => continue,
            Err(e) => return Err(Failure::new(&table, OpKind::Upsert, e).payload(&in_group)),
        }
    }

    let hex = if color_group && code.starts_with('#') { code } else { "" };
    let row = row_of([
        ("id_attribute_group", json!(group_id)),
        ("color", json!(hex)),
        ("position", json!(index)),
    ]);
    let row = ctx.prepare(&table, row).await;
    let id = ctx
        .target()
        .insert(&table, &row, Some("id_attribute"))
        .await
        .map_err(|e| Failure::new(&table, OpKind::Insert, e).payload(&row))?
        .ok_or_else(|| Failure::new(&table, OpKind::Insert, "insert returned no id"))?;
    debug!(code, id, "attribute value created");
    let names = row_of([("name", json!(code))]);
    write_translations(ctx, "id_attribute", id, VALUE_LANG, &names, VALUE_SHOP).await;
    Ok(id)
}

/// Existing combination of this entity carrying `attribute_id`, or a new one.
async fn ensure_combination(
    ctx: &mut RunContext<'_>,
    entity_id: i64,
    attribute_id: i64,
    variant: &Value,
) -> Result<i64, Failure> {
    let table = ctx.table(COMBINATION);
    let link_table = ctx.table(COMBINATION_LINK);
    let mapped = resolve_fields(ctx, &table_fields(ctx, COMBINATION), variant);

    let link_lookup = row_of([("id_attribute", json!(attribute_id))]);
    let candidates = ctx
        .target()
        .select_ids(&link_table, "id_product_attribute", &link_lookup)
        .await
        .map_err(|e| Failure::new(&link_table, OpKind::Upsert, e).payload(&link_lookup))?;
    let mut existing = None;
    for candidate in candidates {
        let owned = row_of([("id_product_attribute", json!(candidate)), (ENTITY_ID, json!(entity_id))]);
        if let Some(id) = select_first_id(ctx.target(), &table, "id_product_attribute", &owned)
            .await
            .map_err(|e| Failure::new(&table, OpKind::Upsert, e).payload(&owned))?
        {
            existing = Some(id);
            break;
        }
    }

    if let Some(id) = existing {
        if !mapped.is_empty() {
            let set = ctx.prepare(&table, mapped).await;
            ctx.target()
                .update(&table, &set, &row_of([("id_product_attribute", json!(id))]))
                .await
                .map_err(|e| Failure::new(&table, OpKind::Update, e).payload(&set))?;
        }
        return Ok(id);
    }

    let mut row = row_of([(ENTITY_ID, json!(entity_id)), ("quantity", json!(0))]);
    row.extend(mapped);
    let row = ctx.prepare(&table, row).await;
    let id = ctx
        .target()
        .insert(&table, &row, Some("id_product_attribute"))
        .await
        .map_err(|e| Failure::new(&table, OpKind::Insert, e).payload(&row))?
        .ok_or_else(|| Failure::new(&table, OpKind::Insert, "insert returned no id"))?;
    let link = row_of([("id_attribute", json!(attribute_id)), ("id_product_attribute", json!(id))]);
    ctx.upsert_row(&link_table, link, &["id_attribute", "id_product_attribute"], None, None)
        .await;
    Ok(id)
}

async fn write_combination_shops(
    ctx: &mut RunContext<'_>,
    entity_id: i64,
    combination_id: i64,
    variant: &Value,
    default_on: Option<bool>,
) {
    let table = ctx.table(COMBINATION_SHOP);
    let overrides = resolve_fields(ctx, &table_fields(ctx, COMBINATION_SHOP), variant);
    for shop in ctx.scope.shops_for(COMBINATION_SHOP) {
        let mut row = row_of([
            ("id_product_attribute", json!(combination_id)),
            (ENTITY_ID, json!(entity_id)),
            ("id_shop", json!(shop)),
        ]);
        row.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(default) = default_on {
            row.insert("default_on".into(), if default { json!(1) } else { Value::Null });
        }
        ctx.upsert_row(&table, row, &["id_product_attribute", "id_shop"], Some(shop), None)
            .await;
    }
}

async fn update_logged(ctx: &mut RunContext<'_>, table: &str, set: Row, filters: Row) {
    if !ctx.schema.table_exists(table).await {
        return;
    }
    let set = ctx.prepare(table, set).await;
    if set.is_empty() {
        return;
    }
    if let Err(e) = ctx.target().update(table, &set, &filters).await {
        ctx.fail(Failure::new(table, OpKind::Update, e).payload(json!({"set": set, "where": filters})));
    }
}

/// First combination becomes the default everywhere the catalog records one.
async fn mark_default(ctx: &mut RunContext<'_>, entity_id: i64, combinations: &[i64]) {
    let Some(&first) = combinations.first() else {
        return;
    };
    let table = ctx.table(COMBINATION);
    for &id in combinations {
        let flag = if id == first { json!(1) } else { Value::Null };
        update_logged(
            ctx,
            &table,
            row_of([("default_on", flag)]),
            row_of([("id_product_attribute", json!(id))]),
        )
        .await;
    }
    let owner = row_of([(ENTITY_ID, json!(entity_id))]);
    let entity_table = ctx.table(ENTITY);
    let mut set = row_of([("cache_default_attribute", json!(first))]);
    if ctx.schema.column_exists(&entity_table, "product_type").await {
        set.insert("product_type".into(), json!("combinations"));
    }
    update_logged(ctx, &entity_table, set, owner.clone()).await;
    let shop_table = ctx.table(ENTITY_SHOP);
    update_logged(ctx, &shop_table, row_of([("cache_default_attribute", json!(first))]), owner).await;
}

/// Re-apply `product_attribute_shop` overrides to every existing combination.
async fn reapply_shop_overrides(ctx: &mut RunContext<'_>, entity_id: i64) -> usize {
    if table_fields(ctx, COMBINATION_SHOP).is_empty() {
        return 0;
    }
    let table = ctx.table(COMBINATION);
    let owned = row_of([(ENTITY_ID, json!(entity_id))]);
    let ids = match ctx.target().select_ids(&table, "id_product_attribute", &owned).await {
        Ok(ids) => ids,
        Err(e) => {
            ctx.fail(Failure::new(&table, OpKind::Update, e).payload(&owned));
            return 0;
        }
    };
    let group = ctx.scope.mapping.variants.group_name.clone();
    for (index, id) in ids.iter().enumerate() {
        let variant = variant_item(None, index, &group);
        write_combination_shops(ctx, entity_id, *id, &variant, None).await;
    }
    ids.len()
}

/// Returns the number of combinations written (or re-touched).
#[instrument(skip(ctx))]
pub async fn write_variants(ctx: &mut RunContext<'_>, entity_id: i64) -> usize {
    let scope = ctx.scope;
    let variants = &scope.mapping.variants;
    let codes = if variants.enabled {
        variant_values(variants.source.resolve(&ctx.source()))
    } else {
        Vec::new()
    };
    if codes.is_empty() {
        let n = reapply_shop_overrides(ctx, entity_id).await;
        debug!(combinations = n, "no variant values; shop overrides re-applied");
        return n;
    }
    if !ctx.schema.table_exists(&ctx.table(COMBINATION)).await {
        debug!("no combination table on target");
        return 0;
    }
    let Some(id_lang) = scope.id_lang_default else {
        let table = ctx.table(GROUP);
        ctx.fail(Failure::new(table, OpKind::Pipeline("attributes".into()), "no language to name attributes in"));
        return 0;
    };

    let group_name = variants.group_name.clone();
    let group_id = match ensure_group(ctx, &group_name, id_lang).await {
        Ok(id) => id,
        Err(f) => {
            ctx.fail(f);
            return 0;
        }
    };
    let color = is_color_group(&group_name);
    let stock_table = ctx.table(STOCK);
    let stock_exists = ctx.schema.table_exists(&stock_table).await;

    let mut combinations = Vec::new();
    for (index, code) in codes.iter().enumerate() {
        let variant = variant_item(Some(code.as_str()), index, &group_name);
        let attribute = ensure_value(ctx, group_id, color, code, index, id_lang).await;
        let Some(attribute_id) = ctx.collect(attribute) else {
            continue;
        };
        let combination = ensure_combination(ctx, entity_id, attribute_id, &variant).await;
        let Some(combination_id) = ctx.collect(combination) else {
            continue;
        };
        let is_default = combinations.is_empty();
        write_combination_shops(ctx, entity_id, combination_id, &variant, Some(is_default)).await;
        if stock_exists {
            for shop in ctx.scope.shops_for(STOCK) {
                let outcome = ensure_stock_row(ctx, &stock_table, entity_id, combination_id, shop, None).await;
                ctx.collect(outcome);
            }
        }
        combinations.push(combination_id);
    }
    mark_default(ctx, entity_id, &combinations).await;
    info!(group = %group_name, combinations = combinations.len(), "variants written");
    combinations.len()
}
