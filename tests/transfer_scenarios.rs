mod support;

use anyhow::Result;
use catalog_sync::database_ops::schema_cache::{ColumnCategory, SchemaCache};
use catalog_sync::database_ops::store::SyncStore;
use catalog_sync::database_ops::transfer::audit::OpKind;
use catalog_sync::database_ops::transfer::SyncError;
use serde_json::{json, Value};
use support::{options, prestashop, with_category_tables, with_custom_tables, Harness};

fn lamp() -> Value {
    json!({
        "product": {
            "reference": "LAMP-1",
            "name": "Desk lamp",
            "price": "19,90€",
            "quantity": 5
        }
    })
}

fn lamp_mapping() -> Value {
    json!({
        "fields": {"reference": "reference", "price": "price"},
        "tables": {"stock_available": {"fields": {"quantity": "quantity"}}}
    })
}

#[tokio::test]
async fn new_record_creates_entity_with_shop_lang_and_stock_rows() -> Result<()> {
    let db = prestashop(&[1], &[1, 2]);
    let h = Harness::new()?;
    let (result, audit) = h.run(&db, &lamp(), &options(lamp_mapping())).await;
    let summary = result?;

    assert!(summary.created);
    assert!(audit.is_empty(), "unexpected audit entries: {:?}", audit.entries());
    for p in ["entity", "shops", "langs", "stock", "generic"] {
        assert!(summary.pipelines.iter().any(|s| s == p), "missing pipeline {p}");
    }

    let products = db.rows("ps_product");
    assert_eq!(products.len(), 1);
    let product = &products[0];
    assert_eq!(product["id_product"], json!(summary.entity_id));
    assert_eq!(product["reference"], json!("LAMP-1"));
    assert_eq!(product["price"], json!(19.9));
    assert_eq!(product["id_shop_default"], json!(1));
    assert!(product.get("date_add").is_some_and(|v| v.is_string()));

    let shop_rows = db.rows("ps_product_shop");
    assert_eq!(shop_rows.len(), 1);
    assert_eq!(shop_rows[0]["price"], json!(19.9));
    assert_eq!(shop_rows[0]["visibility"], json!("both"));
    assert_eq!(shop_rows[0]["condition"], json!("new"));

    let lang_rows = db.rows("ps_product_lang");
    assert_eq!(lang_rows.len(), 2);
    for row in &lang_rows {
        assert_eq!(row["name"], json!("Desk lamp"));
        assert_eq!(row["link_rewrite"], json!("desk-lamp"));
    }

    let stock = db.rows("ps_stock_available");
    assert_eq!(stock.len(), 1);
    assert_eq!(stock[0]["quantity"], json!(5));
    assert_eq!(stock[0]["id_product_attribute"], json!(0));
    assert_eq!(stock[0]["out_of_stock"], json!(2));
    assert_eq!(summary.scalars["name"], json!("Desk lamp"));
    Ok(())
}

#[tokio::test]
async fn rerunning_the_same_record_is_idempotent() -> Result<()> {
    let db = prestashop(&[1, 2], &[1, 2]);
    let h = Harness::new()?;
    let opts = options(lamp_mapping());

    let (first, _) = h.run(&db, &lamp(), &opts).await;
    let first = first?;
    let (second, audit) = h.run(&db, &lamp(), &opts).await;
    let second = second?;

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.entity_id, second.entity_id);
    assert!(audit.is_empty());
    assert_eq!(db.rows("ps_product").len(), 1);
    assert_eq!(db.rows("ps_product_shop").len(), 2);
    assert_eq!(db.rows("ps_product_lang").len(), 4);
    assert_eq!(db.rows("ps_stock_available").len(), 2);
    Ok(())
}

#[tokio::test]
async fn inactive_shops_and_languages_are_never_targeted() -> Result<()> {
    let db = prestashop(&[1, 2], &[1]);
    let h = Harness::new()?;
    h.run(&db, &lamp(), &options(lamp_mapping())).await.0?;

    assert!(db.rows_where("ps_product_shop", &[("id_shop", json!(99))]).is_empty());
    assert!(db.rows_where("ps_product_lang", &[("id_lang", json!(98))]).is_empty());
    assert_eq!(db.rows_where("ps_product_lang", &[("id_shop", json!(2))]).len(), 1);
    Ok(())
}

#[tokio::test]
async fn mapping_shop_list_overrides_active_shops() -> Result<()> {
    let db = prestashop(&[1, 2, 3], &[1]);
    let h = Harness::new()?;
    let mut mapping = lamp_mapping();
    mapping["id_shops"] = json!([2]);
    mapping["tables"]["product_shop"] = json!({"settings": {"id_shops": [2, 3]}});
    h.run(&db, &lamp(), &options(mapping)).await.0?;

    let shops: Vec<Value> = db.rows("ps_product_shop").iter().map(|r| r["id_shop"].clone()).collect();
    assert_eq!(shops, vec![json!(2), json!(3)]);
    assert_eq!(db.rows("ps_stock_available").len(), 1);
    assert_eq!(db.rows("ps_product")[0]["id_shop_default"], json!(2));
    Ok(())
}

#[tokio::test]
async fn long_values_are_clamped_and_audited() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    let h = Harness::new()?;
    let long_ref = "R".repeat(70);
    let record = json!({"product": {"reference": long_ref, "name": "Lamp"}});
    let opts = options(json!({"fields": {"reference": "reference"}}));

    let (result, audit) = h.run(&db, &record, &opts).await;
    let summary = result?;
    assert_eq!(summary.truncations, 1);
    assert_eq!(summary.failures, 0);
    let entry = &audit.entries()[0].failure;
    assert_eq!(entry.op, OpKind::Truncate);
    assert_eq!(entry.table, "ps_product");
    assert_eq!(entry.payload["column"], json!("reference"));
    assert_eq!(entry.payload["before_len"], json!(70));
    assert_eq!(entry.payload["after_len"], json!(64));
    assert_eq!(entry.payload["max_len"], json!(64));
    assert!(entry.payload.get("before").is_none());
    assert_eq!(db.rows("ps_product")[0]["reference"], json!("R".repeat(64)));

    // the clamped reference still finds the entity next time
    let (again, _) = h.run(&db, &record, &opts).await;
    assert_eq!(again?.entity_id, summary.entity_id);
    assert_eq!(db.rows("ps_product").len(), 1);
    Ok(())
}

#[tokio::test]
async fn columns_missing_on_the_target_are_omitted_silently() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    let h = Harness::new()?;
    let mapping = json!({
        "flags": {"unified_dynamic": true},
        "fields": {"reference": "reference", "legacy_code": "=X"},
        "tables": {"product_shop": {"fields": {"bogus": "=1"}}}
    });
    let (result, audit) = h.run(&db, &lamp(), &options(mapping)).await;
    result?;

    assert!(audit.is_empty());
    assert!(db.rows("ps_product_shop")[0].get("bogus").is_none());
    assert!(db.rows("ps_product")[0].get("legacy_code").is_none());
    Ok(())
}

#[tokio::test]
async fn one_failing_shop_row_does_not_abort_the_run() -> Result<()> {
    let db = prestashop(&[7, 8], &[1]);
    db.fail_upserts_where("ps_product_shop", "id_shop", json!(7));
    let h = Harness::new()?;

    let (result, audit) = h.run(&db, &lamp(), &options(lamp_mapping())).await;
    let summary = result?;

    assert_eq!(audit.failure_count(), 1);
    let failure = &audit.entries()[0].failure;
    assert_eq!(failure.op, OpKind::Upsert);
    assert_eq!(failure.table, "ps_product_shop");
    assert_eq!(failure.id_shop, Some(7));
    assert_eq!(failure.id_entity, Some(summary.entity_id));

    let shop_rows = db.rows("ps_product_shop");
    assert_eq!(shop_rows.len(), 1);
    assert_eq!(shop_rows[0]["id_shop"], json!(8));
    // later pipelines still ran
    assert_eq!(db.rows("ps_stock_available").len(), 2);
    Ok(())
}

#[tokio::test]
async fn strict_mapping_disables_legacy_keys() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    let h = Harness::new()?;
    let record = json!({"product": {"sku": "S-9", "name": "Chair", "price": 12}});

    h.run(&db, &record, &options(json!({"fields": {"id_shop_default": "=1"}}))).await.0?;
    let product = &db.rows("ps_product")[0];
    assert_eq!(product["reference"], json!("S-9"));
    assert_eq!(product["price"], json!(12));

    let strict_db = prestashop(&[1], &[1]);
    let strict = json!({"flags": {"strict_mapping_only": true}, "fields": {"id_shop_default": "=1"}});
    h.run(&strict_db, &record, &options(strict)).await.0?;
    let product = &strict_db.rows("ps_product")[0];
    assert!(product.get("reference").is_none());
    assert!(product.get("price").is_none());
    assert!(strict_db.rows("ps_product_lang")[0].get("name").is_none());
    Ok(())
}

#[tokio::test]
async fn entity_is_found_by_name_when_there_is_no_reference() -> Result<()> {
    let db = prestashop(&[1], &[1, 2]);
    let h = Harness::new()?;
    let record = json!({"product": {"title": "Oak table"}});
    let opts = options(json!({"tables": {"product_lang": {"fields": {"name": "title"}}}}));

    let first = h.run(&db, &record, &opts).await.0?;
    let second = h.run(&db, &record, &opts).await.0?;
    assert!(!second.created);
    assert_eq!(first.entity_id, second.entity_id);
    assert_eq!(db.rows("ps_product").len(), 1);
    Ok(())
}

#[tokio::test]
async fn forced_entity_id_must_exist() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    let h = Harness::new()?;
    let mut opts = options(lamp_mapping());
    opts.forced_entity_id = Some(42);

    let (result, audit) = h.run(&db, &lamp(), &opts).await;
    assert!(matches!(result, Err(SyncError::EntityNotFound(42))));
    assert!(audit.is_empty());
    assert!(db.rows("ps_product").is_empty());

    let created = h.run(&db, &lamp(), &options(lamp_mapping())).await.0?;
    let mut opts = options(lamp_mapping());
    opts.forced_entity_id = Some(created.entity_id);
    let other = json!({"product": {"reference": "OTHER", "price": "3.50"}});
    let updated = h.run(&db, &other, &opts).await.0?;
    assert!(!updated.created);
    assert_eq!(updated.entity_id, created.entity_id);
    let product = &db.rows("ps_product")[0];
    assert_eq!(product["reference"], json!("OTHER"));
    assert_eq!(product["price"], json!(3.5));
    Ok(())
}

#[tokio::test]
async fn mapping_precedence_explicit_then_versioned_then_legacy() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    let h = Harness::new()?;
    let priced = |p: i64| json!({"fields": {"reference": "reference", "price": format!("={p}")}});
    h.store.add_legacy("shop-a", "products", priced(3));

    let mut opts = options(json!({}));
    opts.explicit_mapping = None;
    let legacy = h.run(&db, &lamp(), &opts).await.0?;
    assert_eq!(legacy.mapping_version, None);
    assert_eq!(db.rows("ps_product")[0]["price"], json!(3));

    h.store.save_mapping("shop-a", "products", &priced(5)).await?;
    h.store.save_mapping("shop-a", "products", &priced(6)).await?;
    let latest = h.run(&db, &lamp(), &opts).await.0?;
    assert_eq!(latest.mapping_version, Some(2));
    assert_eq!(db.rows("ps_product")[0]["price"], json!(6));

    opts.pinned_version = Some(1);
    let pinned = h.run(&db, &lamp(), &opts).await.0?;
    assert_eq!(pinned.mapping_version, Some(1));
    assert_eq!(db.rows("ps_product")[0]["price"], json!(5));

    // a pinned version that does not exist falls through to the legacy row
    opts.pinned_version = Some(9);
    let fallback = h.run(&db, &lamp(), &opts).await.0?;
    assert_eq!(fallback.mapping_version, None);
    assert_eq!(db.rows("ps_product")[0]["price"], json!(3));

    let explicit = h.run(&db, &lamp(), &options(priced(7))).await.0?;
    assert_eq!(explicit.mapping_version, None);
    assert_eq!(db.rows("ps_product")[0]["price"], json!(7));
    Ok(())
}

#[tokio::test]
async fn no_mapping_anywhere_is_an_error() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    let h = Harness::new()?;
    let opts = options(json!({}));

    let (result, _) = h.run(&db, &lamp(), &opts).await;
    let err = result.expect_err("run without mapping must fail");
    assert_eq!(err.code(), "mapping_missing");
    assert!(db.rows("ps_product").is_empty());
    Ok(())
}

#[tokio::test]
async fn malformed_mapping_is_rejected_before_writing() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    let h = Harness::new()?;
    let opts = options(json!({"fields": {"price": {"path": 12}}}));

    let (result, _) = h.run(&db, &lamp(), &opts).await;
    assert!(matches!(result, Err(SyncError::MappingInvalid { .. })));
    assert!(db.rows("ps_product").is_empty());
    Ok(())
}

#[tokio::test]
async fn generic_tables_skip_rows_without_a_complete_key() -> Result<()> {
    let db = prestashop(&[1], &[1, 2]);
    with_custom_tables(&db);
    let h = Harness::new()?;
    let mapping = json!({
        "fields": {"reference": "reference"},
        "tables": {
            "product_extra": {"fields": {"note": "=handle with care"}},
            "product_code": {"fields": {"code": "item.gtin_missing", "label": "=EAN"}}
        }
    });

    let (result, audit) = h.run(&db, &lamp(), &options(mapping)).await;
    let summary = result?;

    let extra = db.rows("ps_product_extra");
    assert_eq!(extra.len(), 2);
    assert!(extra.iter().all(|r| r["id_product"] == json!(summary.entity_id)));
    assert!(db.rows("ps_product_code").is_empty());

    assert_eq!(audit.failure_count(), 1);
    let skip = &audit.entries()[0].failure;
    assert_eq!(skip.op, OpKind::SkipMissingPk);
    assert_eq!(skip.table, "ps_product_code");
    assert!(skip.message.contains("code"));
    Ok(())
}

#[tokio::test]
async fn base_tables_are_written_first_and_their_ids_reused() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    with_custom_tables(&db);
    let h = Harness::new()?;
    let mapping = json!({
        "fields": {"reference": "reference"},
        "tables": {
            "product_custom_block": {},
            "custom_block": {"fields": {"title": "=Care"}, "settings": {"base": true, "lookup": ["title"]}}
        }
    });
    let opts = options(mapping);

    h.run(&db, &lamp(), &opts).await.0?;
    h.run(&db, &lamp(), &opts).await.0?;

    let blocks = db.rows("ps_custom_block");
    assert_eq!(blocks.len(), 1);
    let links = db.rows("ps_product_custom_block");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["id_custom_block"], blocks[0]["id_custom_block"]);
    Ok(())
}

#[tokio::test]
async fn serial_key_tables_are_skipped_unless_designated_as_base() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    with_custom_tables(&db);
    let h = Harness::new()?;
    let opts = options(json!({
        "fields": {"reference": "reference"},
        "tables": {"custom_block": {"fields": {"title": "=Care"}}}
    }));

    for _ in 0..2 {
        let (result, audit) = h.run(&db, &lamp(), &opts).await;
        result?;
        let skips: Vec<_> = audit
            .entries()
            .iter()
            .filter(|e| e.failure.op == OpKind::SkipMissingPk)
            .collect();
        assert_eq!(skips.len(), 1);
        assert_eq!(skips[0].failure.table, "ps_custom_block");
        assert!(skips[0].failure.message.contains("id_custom_block"));
    }
    assert!(db.rows("ps_custom_block").is_empty());
    Ok(())
}

#[tokio::test]
async fn mapping_defaults_win_over_settings_defaults() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    with_custom_tables(&db);
    let h = Harness::new()?;
    let opts = options(json!({
        "fields": {"reference": "reference"},
        "defaults": {"product_extra": {"note": "from mapping defaults"}},
        "tables": {"product_extra": {"settings": {"defaults": {"note": "from settings defaults"}}}}
    }));

    h.run(&db, &lamp(), &opts).await.0?;
    let extra = db.rows("ps_product_extra");
    assert_eq!(extra.len(), 1);
    assert_eq!(extra[0]["note"], json!("from mapping defaults"));
    Ok(())
}

#[tokio::test]
async fn one_failing_shop_in_a_generic_table_does_not_stop_the_others() -> Result<()> {
    let db = prestashop(&[7, 8], &[1]);
    with_custom_tables(&db);
    db.fail_upserts_where("ps_product_badge", "id_shop", json!(7));
    let h = Harness::new()?;
    let opts = options(json!({
        "fields": {"reference": "reference"},
        "tables": {"product_badge": {"fields": {"label": "=New"}}}
    }));

    let (result, audit) = h.run(&db, &lamp(), &opts).await;
    let summary = result?;

    assert_eq!(audit.failure_count(), 1);
    let failure = &audit.entries()[0].failure;
    assert_eq!(failure.table, "ps_product_badge");
    assert_eq!(failure.op, OpKind::Upsert);
    assert_eq!(failure.id_shop, Some(7));
    assert_eq!(failure.id_entity, Some(summary.entity_id));

    let badges = db.rows("ps_product_badge");
    assert_eq!(badges.len(), 1);
    assert_eq!(badges[0]["id_shop"], json!(8));
    assert_eq!(badges[0]["label"], json!("New"));
    Ok(())
}

#[tokio::test]
async fn creation_stamps_survive_reruns() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    let h = Harness::new()?;
    let opts = options(lamp_mapping());

    h.run(&db, &lamp(), &opts).await.0?;
    let old = json!("2001-01-01 00:00:00");
    db.set_where("ps_product", &[], "date_add", old.clone());
    db.set_where("ps_product_shop", &[], "date_add", old.clone());

    h.run(&db, &lamp(), &opts).await.0?;
    assert_eq!(db.rows("ps_product")[0]["date_add"], old);
    assert_eq!(db.rows("ps_product_shop")[0]["date_add"], old);
    assert!(db.rows("ps_product_shop")[0]["date_upd"].is_string());
    Ok(())
}

#[tokio::test]
async fn non_product_records_write_their_own_base_table() -> Result<()> {
    let db = prestashop(&[1, 2], &[1]);
    with_category_tables(&db);
    let h = Harness::new()?;
    let mut opts = options(json!({
        "tables": {
            "category": {"defaults": {"id_parent": 2}},
            "category_lang": {"fields": {"name": "item.name"}},
            "category_shop": {}
        }
    }));
    opts.category = "category".into();
    let record = json!({"item": {"name": "Lamps"}});

    let (result, audit) = h.run(&db, &record, &opts).await;
    let summary = result?;
    assert!(audit.is_empty(), "unexpected audit entries: {:?}", audit.entries());
    assert!(summary.created);
    assert_eq!(summary.pipelines, vec!["entity".to_string(), "generic".to_string()]);

    assert!(db.rows("ps_product").is_empty());
    assert!(db.rows("ps_product_shop").is_empty());
    assert!(db.rows("ps_stock_available").is_empty());

    let categories = db.rows("ps_category");
    assert_eq!(categories.len(), 1);
    assert_eq!(categories[0]["id_category"], json!(summary.entity_id));
    assert_eq!(categories[0]["id_parent"], json!(2));
    let names = db.rows("ps_category_lang");
    assert_eq!(names.len(), 2);
    assert!(names
        .iter()
        .all(|r| r["id_category"] == json!(summary.entity_id) && r["name"] == json!("Lamps")));
    assert_eq!(db.rows("ps_category_shop").len(), 2);

    // a rerun against the known id updates in place
    let old = json!("2001-01-01 00:00:00");
    db.set_where("ps_category", &[], "date_add", old.clone());
    opts.forced_entity_id = Some(summary.entity_id);
    let again = h.run(&db, &record, &opts).await.0?;
    assert!(!again.created);
    assert_eq!(again.entity_id, summary.entity_id);
    assert_eq!(db.rows("ps_category").len(), 1);
    assert_eq!(db.rows("ps_category")[0]["date_add"], old);
    assert_eq!(db.rows("ps_category_lang").len(), 2);
    Ok(())
}

#[tokio::test]
async fn stored_table_settings_feed_the_generic_writer() -> Result<()> {
    let db = prestashop(&[1], &[1, 2]);
    with_custom_tables(&db);
    let h = Harness::new()?;
    h.store.add_table_settings(
        "shop-a",
        "ps_product_extra",
        json!({"id_langs": [2]}),
        json!({"note": "=from settings"}),
    );

    h.run(&db, &lamp(), &options(lamp_mapping())).await.0?;
    let extra = db.rows("ps_product_extra");
    assert_eq!(extra.len(), 1);
    assert_eq!(extra[0]["id_lang"], json!(2));
    assert_eq!(extra[0]["note"], json!("from settings"));
    Ok(())
}

#[tokio::test]
async fn generic_writer_can_be_narrowed_to_named_tables() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    with_custom_tables(&db);
    let h = Harness::new()?;
    let mut opts = options(json!({
        "fields": {"reference": "reference"},
        "tables": {
            "product_extra": {"fields": {"note": "=n"}},
            "product_code": {"fields": {"code": "=C1"}}
        }
    }));
    opts.generic_tables = Some(vec!["ps_product_code".into()]);

    let (result, audit) = h.run(&db, &lamp(), &opts).await;
    result?;
    assert!(audit.is_empty());
    assert!(db.rows("ps_product_extra").is_empty());
    assert_eq!(db.rows("ps_product_code").len(), 1);
    Ok(())
}

#[tokio::test]
async fn schema_cache_reports_limits_and_types() -> Result<()> {
    let db = prestashop(&[1], &[1]);
    let schema = SchemaCache::new(&db);

    assert_eq!(schema.column_max_length("ps_product", "reference").await, 64);
    assert_eq!(schema.column_max_length("ps_product", "price").await, 0);
    assert_eq!(schema.column_max_length("ps_missing", "reference").await, 0);

    let ty = schema.column_type("ps_product", "date_add").await.expect("known column");
    assert_eq!(ty.category, ColumnCategory::Date);
    assert!(ty.nullable && !ty.boolean);
    assert!(schema.column_type("ps_product", "bogus").await.is_none());
    Ok(())
}
