//! Name/value features: allow-listed record attributes plus metadata
//! `additionalProperty` pairs, linked to the entity.

use indexmap::IndexMap;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use super::audit::{Failure, OpKind};
use super::context::RunContext;
use super::mapping::FeatureSettings;
use super::rows::row_of;
use super::scope::ENTITY_ID;
use crate::database_ops::target::select_first_id;
use crate::normalization::field_spec::{render, Source};
use crate::normalization::text::normalize_name;

const FEATURE: &str = "feature";
const FEATURE_LANG: &str = "feature_lang";
const FEATURE_SHOP: &str = "feature_shop";
const FEATURE_VALUE: &str = "feature_value";
const FEATURE_VALUE_LANG: &str = "feature_value_lang";
const FEATURE_LINK: &str = "feature_product";

/// Canonical feature name → normalized aliases that map to it.
const BUILTIN_ALIASES: [(&str, &[&str]); 8] = [
    ("Brand", &["brand", "marque", "manufacturer", "marca", "marke"]),
    ("Material", &["material", "matiere", "materiau", "composition"]),
    ("Color", &["color", "colour", "couleur", "farbe"]),
    ("Weight", &["weight", "poids", "gewicht"]),
    ("Dimensions", &["dimensions", "size", "taille", "abmessungen"]),
    ("Warranty", &["warranty", "garantie", "guarantee"]),
    ("Country of origin", &["country of origin", "origin", "pays d origine", "made in"]),
    ("Model", &["model", "modele", "modell"]),
];

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureCandidate {
    pub name: String,
    pub value: String,
}

/// normalized alias → canonical name
fn alias_table(settings: &FeatureSettings) -> IndexMap<String, String> {
    let mut table = IndexMap::new();
    for (canonical, aliases) in BUILTIN_ALIASES {
        table.insert(normalize_name(canonical), canonical.to_string());
        for alias in aliases {
            table.insert(normalize_name(alias), canonical.to_string());
        }
    }
    for (alias, canonical) in &settings.aliases {
        table.insert(normalize_name(alias), canonical.clone());
    }
    for allowed in &settings.allow {
        table.entry(normalize_name(allowed)).or_insert_with(|| allowed.clone());
    }
    table
}

fn pair_of(item: &Value) -> Option<(String, String)> {
    let obj = item.as_object()?;
    let name = ["name", "label", "key"]
        .iter()
        .find_map(|k| obj.get(*k))
        .map(render)?;
    let value = obj.get("value").map(render)?;
    let (name, value) = (name.trim().to_string(), value.trim().to_string());
    (!name.is_empty() && !value.is_empty()).then_some((name, value))
}

/// Allow-listed `attributes[]` rows (by normalized alias) followed by every metadata
/// `additionalProperty` pair, de-duplicated on (name, value).
pub fn collect_candidates(record: &Value, settings: &FeatureSettings) -> Vec<FeatureCandidate> {
    let src = Source::new(record);
    let aliases = alias_table(settings);
    let mut out: Vec<FeatureCandidate> = Vec::new();
    let mut seen: Vec<(String, String)> = Vec::new();
    let mut push = |name: String, value: String| {
        let key = (normalize_name(&name), normalize_name(&value));
        if !seen.contains(&key) {
            seen.push(key);
            out.push(FeatureCandidate { name, value });
        }
    };

    let attributes = record
        .get("attributes")
        .or_else(|| src.item().get("attributes"))
        .and_then(Value::as_array);
    for item in attributes.into_iter().flatten() {
        if let Some((name, value)) = pair_of(item) {
            if let Some(canonical) = aliases.get(&normalize_name(&name)) {
                push(canonical.clone(), value);
            }
        }
    }

    let props = src
        .meta()
        .and_then(|m| m.get("additionalProperty"))
        .and_then(Value::as_array);
    for item in props.into_iter().flatten() {
        if let Some((name, value)) = pair_of(item) {
            push(name, value);
        }
    }
    out
}

/// Find a row of `table` (id column `id_column`) through its translation text in the
/// default language, optionally constrained on the parent table.
async fn find_by_text(
    ctx: &RunContext<'_>,
    lang_bare: &str,
    text_column: &str,
    text: &str,
    id_lang: i64,
    id_column: &str,
    parent: Option<(&str, &str, i64)>,
) -> Result<Option<i64>, Failure> {
    let lang_table = ctx.table(lang_bare);
    let lookup = row_of([(text_column, json!(text)), ("id_lang", json!(id_lang))]);
    let ids = ctx
        .target()
        .select_ids(&lang_table, id_column, &lookup)
        .await
        .map_err(|e| Failure::new(&lang_table, OpKind::Upsert, e).payload(&lookup))?;
    let Some((parent_bare, parent_column, parent_id)) = parent else {
        return Ok(ids.into_iter().next());
    };
    let parent_table = ctx.table(parent_bare);
    for id in ids {
        let filters = row_of([(id_column, json!(id)), (parent_column, json!(parent_id))]);
        let hit = select_first_id(ctx.target(), &parent_table, id_column, &filters)
            .await
            .map_err(|e| Failure::new(&parent_table, OpKind::Upsert, e).payload(&filters))?;
        if hit.is_some() {
            return Ok(hit);
        }
    }
    Ok(None)
}

#[allow(clippy::too_many_arguments)]
async fn insert_with_translations(
    ctx: &mut RunContext<'_>,
    bare: &str,
    id_column: &str,
    row: crate::database_ops::target::Row,
    lang_bare: &str,
    text_column: &str,
    text: &str,
    shop_bare: Option<&str>,
) -> Result<i64, Failure> {
    let table = ctx.table(bare);
    let row = ctx.prepare(&table, row).await;
    let id = ctx
        .target()
        .insert(&table, &row, Some(id_column))
        .await
        .map_err(|e| Failure::new(&table, OpKind::Insert, e).payload(&row))?
        .ok_or_else(|| Failure::new(&table, OpKind::Insert, "insert returned no id"))?;
    let lang_table = ctx.table(lang_bare);
    for lang in ctx.scope.langs_for(lang_bare) {
        let row = row_of([(id_column, json!(id)), ("id_lang", json!(lang)), (text_column, json!(text))]);
        ctx.upsert_row(&lang_table, row, &[id_column, "id_lang"], None, Some(lang)).await;
    }
    if let Some(shop_bare) = shop_bare {
        let shop_table = ctx.table(shop_bare);
        for shop in ctx.scope.shops_for(shop_bare) {
            let row = row_of([(id_column, json!(id)), ("id_shop", json!(shop))]);
            ctx.upsert_row(&shop_table, row, &[id_column, "id_shop"], Some(shop), None).await;
        }
    }
    Ok(id)
}

async fn write_feature(
    ctx: &mut RunContext<'_>,
    entity_id: i64,
    id_lang: i64,
    candidate: &FeatureCandidate,
) -> Result<(), Failure> {
    let feature_id = match find_by_text(ctx, FEATURE_LANG, "name", &candidate.name, id_lang, "id_feature", None).await? {
        Some(id) => id,
        None => {
            insert_with_translations(
                ctx,
                FEATURE,
                "id_feature",
                row_of([("position", json!(0))]),
                FEATURE_LANG,
                "name",
                &candidate.name,
                Some(FEATURE_SHOP),
            )
            .await?
        }
    };

    let value_id = match find_by_text(
        ctx,
        FEATURE_VALUE_LANG,
        "value",
        &candidate.value,
        id_lang,
        "id_feature_value",
        Some((FEATURE_VALUE, "id_feature", feature_id)),
    )
    .await?
    {
        Some(id) => id,
        None => {
            insert_with_translations(
                ctx,
                FEATURE_VALUE,
                "id_feature_value",
                row_of([("id_feature", json!(feature_id)), ("custom", json!(0))]),
                FEATURE_VALUE_LANG,
                "value",
                &candidate.value,
                None,
            )
            .await?
        }
    };

    let link_table = ctx.table(FEATURE_LINK);
    let link = row_of([
        ("id_feature", json!(feature_id)),
        (ENTITY_ID, json!(entity_id)),
        ("id_feature_value", json!(value_id)),
    ]);
    let keys: Vec<String> = link.keys().cloned().collect();
    let link = ctx.prepare(&link_table, link).await;
    ctx.target()
        .upsert(&link_table, &link, &keys)
        .await
        .map_err(|e| Failure::new(&link_table, OpKind::Upsert, e).payload(&link))
}

/// Returns the number of features linked.
#[instrument(skip(ctx))]
pub async fn write_features(ctx: &mut RunContext<'_>, entity_id: i64) -> usize {
    if !ctx.schema.table_exists(&ctx.table(FEATURE)).await {
        debug!("no feature table on target");
        return 0;
    }
    let candidates = collect_candidates(ctx.record, &ctx.scope.mapping.features);
    if candidates.is_empty() {
        return 0;
    }
    let Some(id_lang) = ctx.scope.id_lang_default else {
        let table = ctx.table(FEATURE);
        ctx.fail(Failure::new(table, OpKind::Pipeline("features".into()), "no language to name features in"));
        return 0;
    };

    let mut linked = 0usize;
    for candidate in &candidates {
        let outcome = write_feature(ctx, entity_id, id_lang, candidate)
            .await
            .map_err(|f| {
                let payload = json!({"name": candidate.name, "value": candidate.value, "detail": f.payload});
                Failure { payload, ..f }
            });
        if ctx.collect(outcome).is_some() {
            linked += 1;
        }
    }
    info!(candidates = candidates.len(), linked, "features written");
    linked
}
