#![allow(dead_code)]

pub mod memory;

use catalog_sync::database_ops::transfer::assets::AssetStore;
use catalog_sync::database_ops::transfer::audit::AuditSink;
use catalog_sync::database_ops::transfer::{run_transfer, RunOptions, SyncResult, TransferSummary};
use serde_json::{json, Value};
use tempfile::TempDir;

pub use memory::{FakeFetcher, MemoryCatalog, MemoryStore};

const INT: &str = "integer";

fn id(name: &str) -> memory::ColumnDef<'_> {
    (name, INT, None, false, false)
}

fn auto(name: &str) -> memory::ColumnDef<'_> {
    (name, INT, None, false, true)
}

fn text(name: &str, max: i64) -> memory::ColumnDef<'_> {
    (name, "character varying", Some(max), true, false)
}

fn long_text(name: &str) -> memory::ColumnDef<'_> {
    (name, "text", None, true, false)
}

fn num(name: &str) -> memory::ColumnDef<'_> {
    (name, "numeric", None, true, false)
}

fn stamp(name: &str) -> memory::ColumnDef<'_> {
    (name, "timestamp without time zone", None, true, false)
}

/// A PrestaShop-shaped catalog with the given active shops and languages.
pub fn prestashop(shops: &[i64], langs: &[i64]) -> MemoryCatalog {
    let db = MemoryCatalog::new();
    db.create_table("ps_shop", &["id_shop"], &[auto("id_shop"), num("active"), num("deleted")]);
    db.create_table("ps_lang", &["id_lang"], &[auto("id_lang"), num("active")]);
    for shop in shops {
        db.seed("ps_shop", memory_row(json!({"id_shop": shop, "active": 1, "deleted": 0})));
    }
    // an inactive shop and language that must never be targeted
    db.seed("ps_shop", memory_row(json!({"id_shop": 99, "active": 0, "deleted": 0})));
    for lang in langs {
        db.seed("ps_lang", memory_row(json!({"id_lang": lang, "active": 1})));
    }
    db.seed("ps_lang", memory_row(json!({"id_lang": 98, "active": 0})));

    db.create_table(
        "ps_product",
        &["id_product"],
        &[
            auto("id_product"),
            text("reference", 64),
            num("price"),
            num("wholesale_price"),
            text("ean13", 13),
            num("id_shop_default"),
            num("cache_default_attribute"),
            text("product_type", 32),
            num("cache_has_attachments"),
            stamp("date_add"),
            stamp("date_upd"),
        ],
    );
    db.create_table(
        "ps_product_shop",
        &["id_product", "id_shop"],
        &[
            id("id_product"),
            id("id_shop"),
            num("price"),
            num("active"),
            text("visibility", 16),
            text("condition", 16),
            num("cache_default_attribute"),
            stamp("date_add"),
            stamp("date_upd"),
        ],
    );
    db.create_table(
        "ps_product_lang",
        &["id_product", "id_shop", "id_lang"],
        &[
            id("id_product"),
            id("id_shop"),
            id("id_lang"),
            text("name", 128),
            long_text("description"),
            long_text("description_short"),
            text("link_rewrite", 128),
        ],
    );
    db.create_table(
        "ps_stock_available",
        &["id_stock_available"],
        &[
            auto("id_stock_available"),
            id("id_product"),
            id("id_product_attribute"),
            id("id_shop"),
            id("id_shop_group"),
            num("quantity"),
            num("depends_on_stock"),
            num("out_of_stock"),
        ],
    );
    db
}

/// Attribute groups, values and combinations.
pub fn with_variant_tables(db: &MemoryCatalog) {
    db.create_table(
        "ps_attribute_group",
        &["id_attribute_group"],
        &[auto("id_attribute_group"), num("is_color_group"), text("group_type", 16), num("position")],
    );
    db.create_table(
        "ps_attribute_group_lang",
        &["id_attribute_group", "id_lang"],
        &[id("id_attribute_group"), id("id_lang"), text("name", 128), text("public_name", 64)],
    );
    db.create_table(
        "ps_attribute_group_shop",
        &["id_attribute_group", "id_shop"],
        &[id("id_attribute_group"), id("id_shop")],
    );
    db.create_table(
        "ps_attribute",
        &["id_attribute"],
        &[auto("id_attribute"), id("id_attribute_group"), text("color", 32), num("position")],
    );
    db.create_table(
        "ps_attribute_lang",
        &["id_attribute", "id_lang"],
        &[id("id_attribute"), id("id_lang"), text("name", 128)],
    );
    db.create_table("ps_attribute_shop", &["id_attribute", "id_shop"], &[id("id_attribute"), id("id_shop")]);
    db.create_table(
        "ps_product_attribute",
        &["id_product_attribute"],
        &[auto("id_product_attribute"), id("id_product"), num("quantity"), num("default_on"), text("reference", 64)],
    );
    db.create_table(
        "ps_product_attribute_shop",
        &["id_product_attribute", "id_shop"],
        &[id("id_product_attribute"), id("id_product"), id("id_shop"), num("default_on"), num("price")],
    );
    db.create_table(
        "ps_product_attribute_combination",
        &["id_attribute", "id_product_attribute"],
        &[id("id_attribute"), id("id_product_attribute")],
    );
}

pub fn with_feature_tables(db: &MemoryCatalog) {
    db.create_table("ps_feature", &["id_feature"], &[auto("id_feature"), num("position")]);
    db.create_table(
        "ps_feature_lang",
        &["id_feature", "id_lang"],
        &[id("id_feature"), id("id_lang"), text("name", 128)],
    );
    db.create_table("ps_feature_shop", &["id_feature", "id_shop"], &[id("id_feature"), id("id_shop")]);
    db.create_table(
        "ps_feature_value",
        &["id_feature_value"],
        &[auto("id_feature_value"), id("id_feature"), num("custom")],
    );
    db.create_table(
        "ps_feature_value_lang",
        &["id_feature_value", "id_lang"],
        &[id("id_feature_value"), id("id_lang"), text("value", 255)],
    );
    db.create_table(
        "ps_feature_product",
        &["id_feature", "id_product", "id_feature_value"],
        &[id("id_feature"), id("id_product"), id("id_feature_value")],
    );
}

pub fn with_attachment_tables(db: &MemoryCatalog) {
    db.create_table(
        "ps_attachment",
        &["id_attachment"],
        &[auto("id_attachment"), text("file", 40), text("file_name", 128), num("file_size"), text("mime", 128)],
    );
    db.create_table(
        "ps_attachment_lang",
        &["id_attachment", "id_lang"],
        &[id("id_attachment"), id("id_lang"), text("name", 32), long_text("description")],
    );
    db.create_table(
        "ps_product_attachment",
        &["id_product", "id_attachment"],
        &[id("id_product"), id("id_attachment")],
    );
}

pub fn with_image_tables(db: &MemoryCatalog) {
    db.create_table(
        "ps_image",
        &["id_image"],
        &[auto("id_image"), id("id_product"), num("position"), num("cover")],
    );
    db.create_table(
        "ps_image_lang",
        &["id_image", "id_lang"],
        &[id("id_image"), id("id_lang"), text("legend", 128)],
    );
    db.create_table(
        "ps_image_shop",
        &["id_image", "id_shop"],
        &[id("id_image"), id("id_product"), id("id_shop"), num("cover")],
    );
}

/// Extra tables for the schema-aware writer.
pub fn with_custom_tables(db: &MemoryCatalog) {
    db.create_table(
        "ps_product_extra",
        &["id_product", "id_lang"],
        &[id("id_product"), id("id_lang"), text("note", 255)],
    );
    db.create_table(
        "ps_product_code",
        &["id_product", "code"],
        &[id("id_product"), text("code", 32), text("label", 64)],
    );
    db.create_table(
        "ps_custom_block",
        &["id_custom_block"],
        &[auto("id_custom_block"), text("title", 64)],
    );
    db.create_table(
        "ps_product_custom_block",
        &["id_product", "id_custom_block"],
        &[id("id_product"), id("id_custom_block")],
    );
    db.create_table(
        "ps_product_badge",
        &["id_product", "id_shop"],
        &[id("id_product"), id("id_shop"), text("label", 32)],
    );
}

/// Categories: a serial base table with per-language and per-shop satellites.
pub fn with_category_tables(db: &MemoryCatalog) {
    db.create_table(
        "ps_category",
        &["id_category"],
        &[auto("id_category"), num("id_parent"), num("active"), stamp("date_add"), stamp("date_upd")],
    );
    db.create_table(
        "ps_category_lang",
        &["id_category", "id_shop", "id_lang"],
        &[id("id_category"), id("id_shop"), id("id_lang"), text("name", 128), text("link_rewrite", 128)],
    );
    db.create_table("ps_category_shop", &["id_category", "id_shop"], &[id("id_category"), id("id_shop")]);
}

pub fn memory_row(value: Value) -> catalog_sync::database_ops::target::Row {
    value
        .as_object()
        .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

pub fn options(mapping: Value) -> RunOptions {
    RunOptions {
        catalog_key: "shop-a".into(),
        category: "products".into(),
        explicit_mapping: Some(mapping),
        default_prefix: "ps_".into(),
        ..RunOptions::default()
    }
}

/// Everything one transfer needs besides the target.
pub struct Harness {
    pub store: MemoryStore,
    pub fetcher: FakeFetcher,
    pub assets: AssetStore,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let assets = AssetStore::new(dir.path().join("assets"), dir.path().join("staging"));
        Ok(Self {
            store: MemoryStore::new(),
            fetcher: FakeFetcher::new(),
            assets,
            _dir: dir,
        })
    }

    pub async fn run(
        &self,
        db: &MemoryCatalog,
        record: &Value,
        opts: &RunOptions,
    ) -> (SyncResult<TransferSummary>, AuditSink) {
        let mut audit = AuditSink::new(opts.run_id, &opts.catalog_key, &opts.category);
        let result = run_transfer(db, &self.store, &self.fetcher, &self.assets, record, opts, &mut audit).await;
        (result, audit)
    }
}
