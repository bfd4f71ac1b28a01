use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::error::{SyncError, SyncResult};
use super::mapping::{strip_prefix, Defaults, FieldMap, MappingSpec, StoredTableConfig, TableSettings};
use super::precedence::{non_empty, Precedence};
use crate::database_ops::schema_cache::SchemaCache;
use crate::database_ops::store::SyncStore;
use crate::database_ops::target::Row;

pub const ENTITY: &str = "product";
pub const ENTITY_SHOP: &str = "product_shop";
pub const ENTITY_LANG: &str = "product_lang";
pub const STOCK: &str = "stock_available";
pub const ENTITY_ID: &str = "id_product";

/// Tables owned by the core and fan-out writers; the generic writer leaves them alone.
pub const CORE_TABLES: [&str; 4] = [ENTITY, ENTITY_SHOP, ENTITY_LANG, STOCK];

pub const DEFAULT_PREFIX: &str = "ps_";

/// One table's effective configuration after stored settings and overrides are merged in.
#[derive(Debug, Clone, Default)]
pub struct EffectiveTable {
    pub bare: String,
    pub name: String,
    pub fields: FieldMap,
    pub settings: TableSettings,
    /// `settings.defaults`, overridden by the table entry's `defaults`, overridden by
    /// `defaults.<table>`.
    pub defaults: Defaults,
}

#[derive(Debug, Clone)]
pub struct MappingRequest {
    pub catalog_key: String,
    pub category: String,
    pub explicit: Option<Value>,
    pub pinned_version: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct LoadedMapping {
    pub spec: MappingSpec,
    /// `None` for explicit and legacy mappings.
    pub version: Option<i32>,
    pub source: &'static str,
}

#[derive(Debug, Clone)]
pub struct ResolvedScope {
    pub prefix: String,
    pub mapping: MappingSpec,
    pub mapping_version: Option<i32>,
    pub shops: Vec<i64>,
    pub langs: Vec<i64>,
    pub groups: Vec<i64>,
    pub id_lang_default: Option<i64>,
    pub id_shop_default: Option<i64>,
    pub tables: IndexMap<String, EffectiveTable>,
    /// Bare name of the one table allowed to insert without its generated key.
    pub base_table: Option<String>,
}

impl ResolvedScope {
    pub fn table_name(&self, bare: &str) -> String {
        if bare.starts_with(&self.prefix) {
            bare.to_string()
        } else {
            format!("{}{bare}", self.prefix)
        }
    }

    pub fn table(&self, bare: &str) -> Option<&EffectiveTable> {
        self.tables.get(strip_prefix(bare, &self.prefix))
    }

    pub fn is_base(&self, bare: &str) -> bool {
        let bare = strip_prefix(bare, &self.prefix);
        self.base_table.as_deref().is_some_and(|b| b == bare)
    }

    /// First table whose settings carry `base: true`.
    pub fn flagged_base(&self) -> Option<String> {
        self.tables
            .values()
            .find(|t| t.settings.base)
            .map(|t| t.bare.clone())
    }

    /// Base table of a non-product entity kind: the mapping's `entity_table`, else the
    /// category name.
    pub fn entity_table(&self, category: &str) -> String {
        let raw = self
            .mapping
            .entity_table
            .clone()
            .unwrap_or_else(|| category.trim().to_ascii_lowercase());
        strip_prefix(&raw, &self.prefix).to_string()
    }

    /// Tables a non-product entity writes: the mapping's `entity_tables`, else every
    /// configured table named `<base>_*`. The base table is always first.
    pub fn entity_satellites(&self, base: &str) -> Vec<String> {
        let own = format!("{base}_");
        let mut out = vec![base.to_string()];
        let listed: Vec<String> = match &self.mapping.entity_tables {
            Some(list) => list.iter().map(|t| strip_prefix(t, &self.prefix).to_string()).collect(),
            None => self.tables.keys().filter(|t| t.starts_with(&own)).cloned().collect(),
        };
        out.extend(listed.into_iter().filter(|t| t != base));
        out
    }

    pub fn settings(&self, bare: &str) -> Option<&TableSettings> {
        self.table(bare).map(|t| &t.settings)
    }

    pub fn shops_for(&self, bare: &str) -> Vec<i64> {
        self.settings(bare)
            .and_then(|s| s.id_shops.clone())
            .unwrap_or_else(|| self.shops.clone())
    }

    pub fn langs_for(&self, bare: &str) -> Vec<i64> {
        self.settings(bare)
            .and_then(|s| s.id_langs.clone())
            .unwrap_or_else(|| self.langs.clone())
    }

    pub fn groups_for(&self, bare: &str) -> Vec<i64> {
        self.settings(bare)
            .and_then(|s| s.id_groups.clone())
            .unwrap_or_else(|| self.groups.clone())
    }

    /// Field specs for a table: its own entry (with stored overrides) over the mapping's
    /// top-level `fields`.
    pub fn fields_for(&self, bare: &str) -> FieldMap {
        let mut out = self.mapping.fields.clone();
        if let Some(t) = self.table(bare) {
            for (col, spec) in &t.fields {
                out.insert(col.clone(), spec.clone());
            }
        }
        out
    }

    pub fn defaults_for(&self, bare: &str) -> Defaults {
        match self.table(bare) {
            Some(t) => t.defaults.clone(),
            None => self
                .mapping
                .defaults_for(bare, &self.prefix)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// Mapping precedence: explicit document, then the pinned (or latest) version, then the
/// legacy single-document row.
#[instrument(skip(store, request), fields(catalog_key = %request.catalog_key, category = %request.category))]
pub async fn load_mapping(store: &dyn SyncStore, request: &MappingRequest) -> SyncResult<LoadedMapping> {
    let parse = |raw: &Value| {
        MappingSpec::parse(raw).map_err(|source| SyncError::MappingInvalid {
            catalog_key: request.catalog_key.clone(),
            category: request.category.clone(),
            source,
        })
    };
    let usable = |v: &Value| v.as_object().is_some_and(|o| !o.is_empty());

    if let Some(raw) = request.explicit.as_ref().filter(|v| usable(v)) {
        info!(source = "explicit", "mapping resolved");
        return Ok(LoadedMapping {
            spec: parse(raw)?,
            version: None,
            source: "explicit",
        });
    }

    let versioned = match request.pinned_version {
        Some(v) => store
            .mapping_version(&request.catalog_key, &request.category, v)
            .await
            .map_err(SyncError::Store)?,
        None => store
            .latest_mapping(&request.catalog_key, &request.category)
            .await
            .map_err(SyncError::Store)?,
    };
    if let Some(row) = versioned.filter(|r| usable(&r.mapping)) {
        info!(source = "versioned", version = row.version, "mapping resolved");
        return Ok(LoadedMapping {
            spec: parse(&row.mapping)?,
            version: Some(row.version),
            source: "versioned",
        });
    }

    let legacy = store
        .legacy_mapping(&request.catalog_key, &request.category)
        .await
        .map_err(SyncError::Store)?;
    match legacy.filter(|v| usable(v)) {
        Some(raw) => {
            info!(source = "legacy", "mapping resolved");
            Ok(LoadedMapping {
                spec: parse(&raw)?,
                version: None,
                source: "legacy",
            })
        }
        None => Err(SyncError::MappingMissing(
            request.catalog_key.clone(),
            request.category.clone(),
        )),
    }
}

fn merge_tables(mapping: &MappingSpec, stored: &[StoredTableConfig], prefix: &str) -> IndexMap<String, EffectiveTable> {
    let mut out: IndexMap<String, EffectiveTable> = IndexMap::new();
    let name_of = |bare: &str| format!("{prefix}{bare}");

    for cfg in stored {
        let bare = strip_prefix(&cfg.table, prefix).to_string();
        let entry = out.entry(bare.clone()).or_insert_with(|| EffectiveTable {
            name: name_of(&bare),
            bare: bare.clone(),
            ..EffectiveTable::default()
        });
        entry.settings.overlay(&cfg.settings);
    }

    for (raw_name, table) in &mapping.tables {
        let bare = strip_prefix(raw_name, prefix).to_string();
        let entry = out.entry(bare.clone()).or_insert_with(|| EffectiveTable {
            name: name_of(&bare),
            bare: bare.clone(),
            ..EffectiveTable::default()
        });
        entry.settings.overlay(&table.settings);
        for (col, spec) in &table.fields {
            entry.fields.insert(col.clone(), spec.clone());
        }
        for (col, v) in &table.defaults {
            entry.defaults.insert(col.clone(), v.clone());
        }
    }

    // stored overrides overlay the mapping's table fields
    for cfg in stored {
        let bare = strip_prefix(&cfg.table, prefix);
        if let Some(entry) = out.get_mut(bare) {
            for (col, spec) in &cfg.field_overrides {
                entry.fields.insert(col.clone(), spec.clone());
            }
        }
    }

    for entry in out.values_mut() {
        let mut defaults = entry.settings.defaults.clone();
        let mapped = mapping.defaults_for(&entry.bare, prefix);
        for (col, v) in entry.defaults.iter().chain(mapped.into_iter().flatten()) {
            defaults.insert(col.clone(), v.clone());
        }
        entry.defaults = defaults;
    }
    // mapping defaults for tables that have no entry of their own
    for (raw_name, cols) in &mapping.defaults {
        let bare = strip_prefix(raw_name, prefix).to_string();
        out.entry(bare.clone()).or_insert_with(|| EffectiveTable {
            name: name_of(&bare),
            bare,
            defaults: cols.clone(),
            ..EffectiveTable::default()
        });
    }
    out
}

/// Ids of the rows flagged active (and not deleted) in a dimension table.
async fn active_ids(schema: &SchemaCache<'_>, table: &str, id_column: &str) -> Vec<i64> {
    let Some(info) = schema.table(table).await else {
        debug!(table, "dimension table missing");
        return Vec::new();
    };
    let mut filters = Row::new();
    for (col, wanted) in [("active", true), ("deleted", false)] {
        if let Some(c) = info.column(col) {
            let v = if c.data_type.starts_with("boolean") {
                Value::Bool(wanted)
            } else {
                Value::from(wanted as i64)
            };
            filters.insert(col.to_string(), v);
        }
    }
    match schema.target().select_ids(table, id_column, &filters).await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(table, error = %err, "listing dimension ids failed");
            Vec::new()
        }
    }
}

#[instrument(skip_all, fields(prefix = tracing::field::Empty))]
pub async fn resolve_scope(
    schema: &SchemaCache<'_>,
    loaded: LoadedMapping,
    stored: &[StoredTableConfig],
    default_prefix: &str,
) -> ResolvedScope {
    let mapping = loaded.spec;
    let prefix = Precedence::new("prefix")
        .or("mapping", mapping.prefix.clone())
        .or("configured", Some(default_prefix.to_string()).filter(|p| !p.is_empty()))
        .or("builtin", Some(DEFAULT_PREFIX.to_string()))
        .resolve()
        .unwrap_or_else(|| DEFAULT_PREFIX.to_string());
    tracing::Span::current().record("prefix", prefix.as_str());

    let tables = merge_tables(&mapping, stored, &prefix);

    let shops = match non_empty(mapping.id_shops.clone()) {
        Some(ids) => ids,
        None => active_ids(schema, &format!("{prefix}shop"), "id_shop").await,
    };
    let langs = match non_empty(mapping.id_langs.clone()) {
        Some(ids) => ids,
        None => active_ids(schema, &format!("{prefix}lang"), "id_lang").await,
    };
    let groups = match non_empty(mapping.id_groups.clone()) {
        Some(ids) => ids,
        None => active_ids(schema, &format!("{prefix}group"), "id_group").await,
    };

    let id_shop_default = Precedence::new("default shop")
        .or("mapping", mapping.id_shop_default)
        .or(
            "product_shop settings",
            tables.get(ENTITY_SHOP).and_then(|t| t.settings.id_shop_default),
        )
        .or(
            "product defaults",
            mapping
                .defaults_for(ENTITY, &prefix)
                .and_then(|d| d.get("id_shop_default"))
                .and_then(crate::normalization::numeric::as_id),
        )
        .or("first shop", shops.first().copied())
        .resolve();
    let id_lang_default = Precedence::new("default language")
        .or("mapping", mapping.id_lang)
        .or("first language", langs.first().copied())
        .resolve();

    info!(
        shops = ?shops,
        langs = ?langs,
        groups = groups.len(),
        ?id_shop_default,
        ?id_lang_default,
        "scope resolved"
    );

    ResolvedScope {
        prefix,
        mapping_version: loaded.version,
        mapping,
        shops,
        langs,
        groups,
        id_lang_default,
        id_shop_default,
        tables,
        base_table: None,
    }
}
