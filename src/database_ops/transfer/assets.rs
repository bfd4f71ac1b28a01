//! Document and image downloads linked to the entity.
//!
//! Files are staged first, checked against their magic bytes, then copied into the asset
//! store. Documents are keyed by the SHA-1 of their content so the same file linked from
//! several pages becomes one attachment.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::audit::{Failure, OpKind};
use super::context::RunContext;
use super::rows::row_of;
use super::scope::{ENTITY, ENTITY_ID};
use crate::database_ops::target::select_first_id;
use crate::normalization::field_spec::{render, Source};
use crate::normalization::text::clamp_to_chars;

#[derive(Debug, Clone)]
pub struct Fetched {
    /// URL after redirects.
    pub url: String,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Fetched>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("catalog-sync/0.1")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?;
        Ok(Fetched {
            url: final_url,
            content_type,
            body,
        })
    }
}

/// Where downloads are staged and where accepted files end up.
#[derive(Debug, Clone)]
pub struct AssetStore {
    pub root: PathBuf,
    pub staging: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>, staging: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            staging: staging.into(),
        }
    }

    pub fn document_path(&self, hash: &str) -> PathBuf {
        self.root.join("download").join(hash)
    }

    pub fn image_path(&self, id_image: i64) -> PathBuf {
        self.root.join(image_dir(id_image)).join(format!("{id_image}.jpg"))
    }

    async fn stage(&self, body: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.staging).await?;
        let path = self.staging.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("writing staging file {}", path.display()))?;
        Ok(path)
    }

    async fn commit(&self, staged: &Path, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let copied = tokio::fs::copy(staged, dest).await;
        let _ = tokio::fs::remove_file(staged).await;
        copied.with_context(|| format!("copying into {}", dest.display()))?;
        Ok(())
    }

    /// Stage then copy `body` to `dest`.
    pub async fn store(&self, body: &[u8], dest: &Path) -> Result<()> {
        let staged = self.stage(body).await?;
        self.commit(&staged, dest).await
    }
}

/// `img/p/1/2/3/123.jpg`-style directory for an image id.
pub fn image_dir(id_image: i64) -> PathBuf {
    let mut dir = PathBuf::from("img").join("p");
    for digit in id_image.to_string().chars() {
        dir.push(digit.to_string());
    }
    dir
}

pub fn content_hash(body: &[u8]) -> String {
    format!("{:x}", Sha1::digest(body))
}

pub fn is_pdf(body: &[u8]) -> bool {
    body.starts_with(b"%PDF-")
}

pub fn image_kind(body: &[u8]) -> Option<&'static str> {
    if body.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if body.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if body.starts_with(b"GIF87a") || body.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if body.len() >= 12 && &body[..4] == b"RIFF" && &body[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

fn looks_like_html(fetched: &Fetched) -> bool {
    if fetched
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("html"))
    {
        return true;
    }
    let head = String::from_utf8_lossy(&fetched.body[..fetched.body.len().min(512)]).to_ascii_lowercase();
    head.contains("<html") || head.contains("<!doctype html")
}

fn pdf_href_regex() -> &'static Regex {
    static HREF: OnceLock<Regex> = OnceLock::new();
    HREF.get_or_init(|| {
        Regex::new(r#"(?i)href\s*=\s*["']([^"'#]+?\.pdf(?:\?[^"']*)?)["']"#).expect("static pdf href regex")
    })
}

/// First `.pdf` link in an HTML body, resolved against the page URL.
pub fn extract_pdf_link(html: &str, base: &str) -> Option<String> {
    let href = pdf_href_regex().captures(html)?.get(1)?.as_str().trim();
    let base = url::Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetRef {
    pub url: String,
    pub name: Option<String>,
}

fn asset_refs(record: &Value, key: &str, url_keys: &[&str], name_keys: &[&str]) -> Vec<AssetRef> {
    let src = Source::new(record);
    let list = record
        .get(key)
        .or_else(|| src.item().get(key))
        .and_then(Value::as_array);
    let mut out: Vec<AssetRef> = Vec::new();
    for item in list.into_iter().flatten() {
        let (url, name) = match item {
            Value::String(s) => (s.trim().to_string(), None),
            Value::Object(o) => (
                url_keys
                    .iter()
                    .find_map(|k| o.get(*k))
                    .map(render)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                name_keys
                    .iter()
                    .find_map(|k| o.get(*k))
                    .map(render)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            ),
            _ => continue,
        };
        if url.is_empty() || out.iter().any(|r| r.url == url) {
            continue;
        }
        out.push(AssetRef { url, name });
    }
    out
}

pub fn document_refs(record: &Value) -> Vec<AssetRef> {
    asset_refs(record, "documents", &["url", "href"], &["name", "title", "label"])
}

pub fn image_refs(record: &Value) -> Vec<AssetRef> {
    asset_refs(record, "images", &["url", "src"], &["legend", "alt", "title"])
}

fn file_name_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(str::to_string)))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document.pdf".to_string())
}

/// Everything the asset pipelines need besides the run context.
pub struct AssetPipeline<'a> {
    pub fetcher: &'a dyn AssetFetcher,
    pub store: &'a AssetStore,
}

impl AssetPipeline<'_> {
    /// Download a PDF, following one link out of an HTML landing page if needed.
    async fn fetch_pdf(&self, url: &str) -> Result<Fetched> {
        let first = self.fetcher.fetch(url).await?;
        if is_pdf(&first.body) {
            return Ok(first);
        }
        if looks_like_html(&first) {
            let html = String::from_utf8_lossy(&first.body);
            if let Some(link) = extract_pdf_link(&html, &first.url) {
                debug!(from = url, to = %link, "following pdf link out of html page");
                let second = self.fetcher.fetch(&link).await?;
                if is_pdf(&second.body) {
                    return Ok(second);
                }
            }
        }
        bail!("downloaded content is not a PDF")
    }
}

fn pipeline_failure(ctx: &RunContext<'_>, bare: &str, pipeline: &str, url: &str, err: impl std::fmt::Display) -> Failure {
    Failure::new(ctx.table(bare), OpKind::Pipeline(pipeline.to_string()), err).payload(json!({"url": url}))
}

async fn write_document(
    ctx: &mut RunContext<'_>,
    assets: &AssetPipeline<'_>,
    entity_id: i64,
    doc: &AssetRef,
) -> Result<i64, Failure> {
    let fetched = assets
        .fetch_pdf(&doc.url)
        .await
        .map_err(|e| pipeline_failure(ctx, "attachment", "documents", &doc.url, e))?;
    let hash = content_hash(&fetched.body);
    let dest = assets.store.document_path(&hash);
    if tokio::fs::metadata(&dest).await.is_err() {
        assets
            .store
            .store(&fetched.body, &dest)
            .await
            .map_err(|e| pipeline_failure(ctx, "attachment", "documents", &doc.url, e))?;
    }

    let table = ctx.table("attachment");
    let file_name = file_name_of(&fetched.url);
    let display = doc
        .name
        .clone()
        .unwrap_or_else(|| file_name.trim_end_matches(".pdf").to_string());
    let lookup = row_of([("file", json!(hash))]);
    let existing = select_first_id(ctx.target(), &table, "id_attachment", &lookup)
        .await
        .map_err(|e| Failure::new(&table, OpKind::Upsert, e).payload(&lookup))?;
    let id = match existing {
        Some(id) => id,
        None => {
            let row = row_of([
                ("file", json!(hash)),
                ("file_name", json!(file_name)),
                ("file_size", json!(fetched.body.len())),
                ("mime", json!("application/pdf")),
            ]);
            let row = ctx.prepare(&table, row).await;
            ctx.target()
                .insert(&table, &row, Some("id_attachment"))
                .await
                .map_err(|e| Failure::new(&table, OpKind::Insert, e).payload(&row))?
                .ok_or_else(|| Failure::new(&table, OpKind::Insert, "insert returned no id"))?
        }
    };

    let lang_table = ctx.table("attachment_lang");
    for lang in ctx.scope.langs_for("attachment_lang") {
        let row = row_of([
            ("id_attachment", json!(id)),
            ("id_lang", json!(lang)),
            ("name", json!(display)),
            ("description", json!("")),
        ]);
        ctx.upsert_row(&lang_table, row, &["id_attachment", "id_lang"], None, Some(lang))
            .await;
    }
    let shop_table = ctx.table("attachment_shop");
    for shop in ctx.scope.shops_for("attachment_shop") {
        let row = row_of([("id_attachment", json!(id)), ("id_shop", json!(shop))]);
        ctx.upsert_row(&shop_table, row, &["id_attachment", "id_shop"], Some(shop), None)
            .await;
    }
    let link_table = ctx.table("product_attachment");
    let link = row_of([(ENTITY_ID, json!(entity_id)), ("id_attachment", json!(id))]);
    ctx.upsert_row(&link_table, link, &[ENTITY_ID, "id_attachment"], None, None)
        .await;
    Ok(id)
}

#[instrument(skip(ctx, assets))]
pub async fn write_documents(ctx: &mut RunContext<'_>, assets: &AssetPipeline<'_>, entity_id: i64) -> usize {
    let docs = document_refs(ctx.record);
    if docs.is_empty() {
        return 0;
    }
    if !ctx.schema.table_exists(&ctx.table("attachment")).await {
        warn!("documents present but the target has no attachment table");
        return 0;
    }
    let mut linked = 0usize;
    for doc in &docs {
        let outcome = write_document(ctx, assets, entity_id, doc).await;
        if ctx.collect(outcome).is_some() {
            linked += 1;
        }
    }
    if linked > 0 {
        let entity_table = ctx.table(ENTITY);
        let set = ctx.prepare(&entity_table, row_of([("cache_has_attachments", json!(1))])).await;
        if !set.is_empty() {
            if let Err(e) = ctx
                .target()
                .update(&entity_table, &set, &row_of([(ENTITY_ID, json!(entity_id))]))
                .await
            {
                ctx.fail(Failure::new(&entity_table, OpKind::Update, e).payload(&set));
            }
        }
    }
    info!(documents = docs.len(), linked, "documents written");
    linked
}

async fn write_image(
    ctx: &mut RunContext<'_>,
    assets: &AssetPipeline<'_>,
    entity_id: i64,
    position: usize,
    image: &AssetRef,
    legend: &str,
) -> Result<i64, Failure> {
    let fetched = assets
        .fetcher
        .fetch(&image.url)
        .await
        .map_err(|e| pipeline_failure(ctx, "image", "images", &image.url, e))?;
    if image_kind(&fetched.body).is_none() {
        return Err(pipeline_failure(ctx, "image", "images", &image.url, "unrecognized image signature"));
    }

    let table = ctx.table("image");
    let cover = position == 1;
    let cover_value = if cover { json!(1) } else { Value::Null };
    let lookup = row_of([(ENTITY_ID, json!(entity_id)), ("position", json!(position))]);
    let existing = select_first_id(ctx.target(), &table, "id_image", &lookup)
        .await
        .map_err(|e| Failure::new(&table, OpKind::Upsert, e).payload(&lookup))?;
    let id = match existing {
        Some(id) => {
            let set = ctx.prepare(&table, row_of([("cover", cover_value.clone())])).await;
            if !set.is_empty() {
                ctx.target()
                    .update(&table, &set, &row_of([("id_image", json!(id))]))
                    .await
                    .map_err(|e| Failure::new(&table, OpKind::Update, e).payload(&set))?;
            }
            id
        }
        None => {
            let mut row = lookup.clone();
            row.insert("cover".into(), cover_value.clone());
            let row = ctx.prepare(&table, row).await;
            ctx.target()
                .insert(&table, &row, Some("id_image"))
                .await
                .map_err(|e| Failure::new(&table, OpKind::Insert, e).payload(&row))?
                .ok_or_else(|| Failure::new(&table, OpKind::Insert, "insert returned no id"))?
        }
    };

    assets
        .store
        .store(&fetched.body, &assets.store.image_path(id))
        .await
        .map_err(|e| pipeline_failure(ctx, "image", "images", &image.url, e))?;

    let lang_table = ctx.table("image_lang");
    let legend = clamp_to_chars(image.name.as_deref().unwrap_or(legend), 128);
    for lang in ctx.scope.langs_for("image_lang") {
        let row = row_of([("id_image", json!(id)), ("id_lang", json!(lang)), ("legend", json!(legend))]);
        ctx.upsert_row(&lang_table, row, &["id_image", "id_lang"], None, Some(lang))
            .await;
    }
    let shop_table = ctx.table("image_shop");
    for shop in ctx.scope.shops_for("image_shop") {
        let row = row_of([
            ("id_image", json!(id)),
            (ENTITY_ID, json!(entity_id)),
            ("id_shop", json!(shop)),
            ("cover", cover_value.clone()),
        ]);
        ctx.upsert_row(&shop_table, row, &["id_image", "id_shop"], Some(shop), None)
            .await;
    }
    Ok(id)
}

#[instrument(skip(ctx, assets))]
pub async fn write_images(ctx: &mut RunContext<'_>, assets: &AssetPipeline<'_>, entity_id: i64) -> usize {
    let images = image_refs(ctx.record);
    if images.is_empty() {
        return 0;
    }
    if !ctx.schema.table_exists(&ctx.table("image")).await {
        warn!("images present but the target has no image table");
        return 0;
    }
    let legend = super::entity::resolve_name(ctx).unwrap_or_default();
    let mut stored = 0usize;
    for (i, image) in images.iter().enumerate() {
        let outcome = write_image(ctx, assets, entity_id, i + 1, image, &legend).await;
        if ctx.collect(outcome).is_some() {
            stored += 1;
        }
    }
    info!(images = images.len(), stored, "images written");
    stored
}
