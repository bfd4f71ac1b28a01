//! Parsed mapping documents.
//!
//! A mapping arrives as loosely-typed JSON edited by hand in an admin screen. Everything is
//! parsed up front so a typo in a field spec rejects the load (with its location) instead of
//! silently resolving to nothing in the middle of a run.

use indexmap::IndexMap;
use serde_json::Value;

use crate::normalization::field_spec::{FieldSpec, SpecError};
use crate::normalization::numeric::as_id;

pub type FieldMap = IndexMap<String, FieldSpec>;
pub type Defaults = IndexMap<String, Value>;

/// Settings keys that steer fan-out and keying rather than supplying column values.
pub const HELPER_KEYS: [&str; 8] = [
    "id_shops",
    "id_langs",
    "id_groups",
    "id_shop_default",
    "keys",
    "defaults",
    "lookup",
    "base",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSettings {
    pub id_shops: Option<Vec<i64>>,
    pub id_langs: Option<Vec<i64>>,
    pub id_groups: Option<Vec<i64>>,
    pub id_shop_default: Option<i64>,
    /// Explicit upsert keys; the table's primary key is used when absent.
    pub keys: Option<Vec<String>>,
    pub defaults: Defaults,
    /// Columns used to find an existing base row before inserting one.
    pub lookup: Option<Vec<String>>,
    /// Marks the one table whose generated key may be missing before insert.
    pub base: bool,
    /// Every non-helper key: a fixed column value.
    pub fixed: Defaults,
}

impl TableSettings {
    pub fn parse(raw: &Value, at: &str) -> Result<Self, SpecError> {
        let map = match raw {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            _ => return Err(spec_err(at, "settings must be an object")),
        };
        let mut out = Self::default();
        for (key, value) in map {
            let here = format!("{at}.{key}");
            match key.as_str() {
                "id_shops" => out.id_shops = id_list(value, &here)?,
                "id_langs" => out.id_langs = id_list(value, &here)?,
                "id_groups" => out.id_groups = id_list(value, &here)?,
                "id_shop_default" => out.id_shop_default = as_id(value),
                "keys" => out.keys = name_list(value, &here)?,
                "lookup" => out.lookup = name_list(value, &here)?,
                "defaults" => out.defaults = literal_map(value, &here)?,
                "base" => out.base = truthy(Some(value)),
                _ => {
                    out.fixed.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(out)
    }

    /// `other` wins wherever it says something.
    pub fn overlay(&mut self, other: &TableSettings) {
        if other.id_shops.is_some() {
            self.id_shops = other.id_shops.clone();
        }
        if other.id_langs.is_some() {
            self.id_langs = other.id_langs.clone();
        }
        if other.id_groups.is_some() {
            self.id_groups = other.id_groups.clone();
        }
        if other.id_shop_default.is_some() {
            self.id_shop_default = other.id_shop_default;
        }
        if other.keys.is_some() {
            self.keys = other.keys.clone();
        }
        if other.lookup.is_some() {
            self.lookup = other.lookup.clone();
        }
        self.base |= other.base;
        for (k, v) in &other.defaults {
            self.defaults.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.fixed {
            self.fixed.insert(k.clone(), v.clone());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableMapping {
    pub fields: FieldMap,
    pub settings: TableSettings,
    pub defaults: Defaults,
}

impl TableMapping {
    fn parse(raw: &Value, at: &str) -> Result<Self, SpecError> {
        let map = raw
            .as_object()
            .ok_or_else(|| spec_err(at, "table entry must be an object"))?;
        Ok(Self {
            fields: field_map(map.get("fields").unwrap_or(&Value::Null), &format!("{at}.fields"))?,
            settings: TableSettings::parse(
                map.get("settings").unwrap_or(&Value::Null),
                &format!("{at}.settings"),
            )?,
            defaults: literal_map(map.get("defaults").unwrap_or(&Value::Null), &format!("{at}.defaults"))?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flags {
    /// Disable the legacy well-known-key heuristics.
    pub strict_mapping_only: bool,
    /// Also write extra mapped columns on the per-shop and per-language rows.
    pub unified_dynamic: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantSettings {
    pub enabled: bool,
    pub group_name: String,
    pub source: FieldSpec,
}

impl Default for VariantSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            group_name: "Color".to_string(),
            source: default_variant_source(),
        }
    }
}

fn default_variant_source() -> FieldSpec {
    FieldSpec::Alternatives(
        ["item.colors.codes", "result.colors.codes", "result.variants.colors.codes"]
            .iter()
            .map(|p| FieldSpec::Path(crate::normalization::field_spec::PathRef::parse(p)))
            .collect(),
    )
}

/// Which optional pipelines run after the core entity is written.
#[derive(Debug, Clone, PartialEq)]
pub struct SendSettings {
    pub images: bool,
    pub documents: bool,
    pub attributes: bool,
    pub features: bool,
    pub generic: bool,
}

impl Default for SendSettings {
    fn default() -> Self {
        Self {
            images: false,
            documents: false,
            attributes: true,
            features: true,
            generic: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSettings {
    /// Extra normalized aliases: alias → canonical feature name.
    pub aliases: IndexMap<String, String>,
    /// Attribute names allowed to become features; empty = the alias table decides.
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingSpec {
    pub prefix: Option<String>,
    pub id_lang: Option<i64>,
    pub id_langs: Vec<i64>,
    pub id_shops: Vec<i64>,
    pub id_groups: Vec<i64>,
    pub id_shop_default: Option<i64>,
    pub id_shop_group: Option<i64>,
    pub fields: FieldMap,
    pub tables: IndexMap<String, TableMapping>,
    /// table → column → literal. An explicit `""` is a value, not "unset".
    pub defaults: IndexMap<String, Defaults>,
    pub flags: Flags,
    pub variants: VariantSettings,
    pub send: SendSettings,
    pub features: FeatureSettings,
    /// Base table of a non-product entity kind; the category name when absent.
    pub entity_table: Option<String>,
    /// Tables a non-product entity may write besides its base table.
    pub entity_tables: Option<Vec<String>>,
}

impl MappingSpec {
    pub fn parse(raw: &Value) -> Result<Self, SpecError> {
        let map = match raw {
            Value::Object(map) => map,
            Value::Null => return Ok(Self::default()),
            _ => return Err(spec_err("$", "mapping must be a JSON object")),
        };
        let empty = Value::Null;
        let get = |k: &str| map.get(k).unwrap_or(&empty);

        let mut tables = IndexMap::new();
        if let Some(obj) = get("tables").as_object() {
            for (name, entry) in obj {
                tables.insert(name.clone(), TableMapping::parse(entry, &format!("tables.{name}"))?);
            }
        } else if !get("tables").is_null() {
            return Err(spec_err("tables", "must be an object"));
        }

        let mut defaults = IndexMap::new();
        if let Some(obj) = get("defaults").as_object() {
            for (table, cols) in obj {
                defaults.insert(table.clone(), literal_map(cols, &format!("defaults.{table}"))?);
            }
        }

        let flags_raw = get("flags");
        let flags = Flags {
            strict_mapping_only: truthy(flags_raw.get("strict_mapping_only")),
            unified_dynamic: truthy(flags_raw.get("unified_dynamic")),
        };

        let variants_raw = get("variants");
        let mut variants = VariantSettings {
            enabled: truthy(variants_raw.get("enabled")),
            ..VariantSettings::default()
        };
        if let Some(name) = variants_raw
            .get("group_name")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
        {
            variants.group_name = name.trim().to_string();
        }
        if let Some(src) = variants_raw.get("source") {
            let parsed = FieldSpec::parse(src).map_err(|e| relocate(e, "variants.source"))?;
            if !parsed.is_unset() {
                variants.source = parsed;
            }
        }

        let send_raw = get("send");
        let base = SendSettings::default();
        let flag_or = |k: &str, d: bool| send_raw.get(k).map(|v| truthy(Some(v))).unwrap_or(d);
        let send = SendSettings {
            images: flag_or("images", base.images),
            documents: flag_or("documents", base.documents),
            attributes: flag_or("attributes", base.attributes),
            features: flag_or("features", base.features),
            generic: flag_or("generic", base.generic),
        };

        let features_raw = get("features");
        let mut features = FeatureSettings::default();
        if let Some(aliases) = features_raw.get("aliases").and_then(Value::as_object) {
            for (alias, canonical) in aliases {
                if let Some(c) = canonical.as_str() {
                    features.aliases.insert(alias.clone(), c.to_string());
                }
            }
        }
        if let Some(list) = name_list(features_raw.get("allow").unwrap_or(&Value::Null), "features.allow")? {
            features.allow = list;
        }

        Ok(Self {
            prefix: get("prefix")
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            id_lang: as_id(get("id_lang")),
            id_langs: id_list(get("id_langs"), "id_langs")?.unwrap_or_default(),
            id_shops: id_list(get("id_shops"), "id_shops")?.unwrap_or_default(),
            id_groups: id_list(get("id_groups"), "id_groups")?.unwrap_or_default(),
            id_shop_default: as_id(get("id_shop_default")),
            id_shop_group: as_id(get("id_shop_group")),
            fields: field_map(get("fields"), "fields")?,
            tables,
            defaults,
            flags,
            variants,
            send,
            features,
            entity_table: get("entity_table")
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            entity_tables: name_list(get("entity_tables"), "entity_tables")?,
        })
    }

    /// Table entry by bare name (`product_shop`) or prefixed name (`ps_product_shop`).
    pub fn table(&self, bare: &str, prefix: &str) -> Option<&TableMapping> {
        self.tables
            .get(bare)
            .or_else(|| self.tables.get(&format!("{prefix}{bare}")))
    }

    pub fn defaults_for(&self, bare: &str, prefix: &str) -> Option<&Defaults> {
        self.defaults
            .get(bare)
            .or_else(|| self.defaults.get(&format!("{prefix}{bare}")))
    }
}

/// Settings and field overrides persisted per catalog key, outside the versioned mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredTableConfig {
    pub table: String,
    pub settings: TableSettings,
    pub field_overrides: FieldMap,
}

impl StoredTableConfig {
    pub fn parse(table: &str, settings: &Value, overrides: &Value) -> Result<Self, SpecError> {
        Ok(Self {
            table: table.to_string(),
            settings: TableSettings::parse(settings, &format!("stored.{table}.settings"))?,
            field_overrides: field_map(overrides, &format!("stored.{table}.fields"))?,
        })
    }
}

pub fn strip_prefix<'a>(table: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        table
    } else {
        table.strip_prefix(prefix).unwrap_or(table)
    }
}

fn spec_err(at: &str, reason: &str) -> SpecError {
    SpecError {
        at: at.to_string(),
        reason: reason.to_string(),
    }
}

fn relocate(mut e: SpecError, at: &str) -> SpecError {
    e.at = e.at.replacen('$', at, 1);
    e
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "on" | "yes"
        ),
        _ => false,
    }
}

fn field_map(raw: &Value, at: &str) -> Result<FieldMap, SpecError> {
    match raw {
        Value::Null => Ok(FieldMap::new()),
        Value::Object(map) => map
            .iter()
            .map(|(col, spec)| {
                FieldSpec::parse(spec)
                    .map(|s| (col.clone(), s))
                    .map_err(|e| relocate(e, &format!("{at}.{col}")))
            })
            .collect(),
        _ => Err(spec_err(at, "fields must be an object")),
    }
}

fn literal_map(raw: &Value, at: &str) -> Result<Defaults, SpecError> {
    match raw {
        Value::Null => Ok(Defaults::new()),
        Value::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        _ => Err(spec_err(at, "defaults must be an object")),
    }
}

/// Accepts `[1, "2"]` or `"1,2"`. An empty list counts as "not set".
fn id_list(raw: &Value, at: &str) -> Result<Option<Vec<i64>>, SpecError> {
    let ids: Vec<i64> = match raw {
        Value::Null => return Ok(None),
        Value::Array(items) => items.iter().filter_map(as_id).collect(),
        Value::String(s) => s.split(',').filter_map(|p| p.trim().parse().ok()).collect(),
        Value::Number(_) => as_id(raw).into_iter().collect(),
        _ => return Err(spec_err(at, "expected a list of ids")),
    };
    Ok(Some(ids).filter(|v| !v.is_empty()))
}

fn name_list(raw: &Value, at: &str) -> Result<Option<Vec<String>>, SpecError> {
    let names: Vec<String> = match raw {
        Value::Null => return Ok(None),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => return Err(spec_err(at, "expected a list of column names")),
    };
    Ok(Some(names).filter(|v| !v.is_empty()))
}
