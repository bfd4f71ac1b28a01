//! Runtime configuration read from the environment (and `.env`).
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::env::{env_opt, env_parse, init_env};
use crate::database_ops::transfer::scope::DEFAULT_PREFIX;

const PROFILE_VAR: &str = "CATALOG_DB_URL";

#[derive(Clone)]
pub struct SyncConfig {
    /// Mapping store DSN: `SYNC_STORE_DB_URL`, else `DATABASE_URL`.
    pub store_url: Option<String>,
    pub store_max_connections: u32,
    /// Catalog key (normalized) → target DSN, from `CATALOG_DB_URL_<KEY>`.
    pub profiles: BTreeMap<String, String>,
    /// `CATALOG_DB_URL`, used when no per-key profile exists.
    pub default_profile: Option<String>,
    pub default_prefix: String,
    pub connect_timeout: Duration,
    pub download_timeout: Duration,
    pub asset_root: PathBuf,
    pub staging_dir: PathBuf,
}

// DSNs carry credentials; only report which profiles exist.
impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("store_configured", &self.store_url.is_some())
            .field("store_max_connections", &self.store_max_connections)
            .field("profiles", &self.profiles.keys().collect::<Vec<_>>())
            .field("default_profile", &self.default_profile.is_some())
            .field("default_prefix", &self.default_prefix)
            .field("connect_timeout", &self.connect_timeout)
            .field("download_timeout", &self.download_timeout)
            .field("asset_root", &self.asset_root)
            .field("staging_dir", &self.staging_dir)
            .finish()
    }
}

/// `acme-eu.shop` → `ACME_EU_SHOP`
pub fn profile_key(catalog_key: &str) -> String {
    catalog_key
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        init_env();
        let prefix = format!("{PROFILE_VAR}_");
        let profiles = std::env::vars()
            .filter_map(|(k, v)| {
                let key = k.strip_prefix(&prefix)?;
                (!key.is_empty() && !v.trim().is_empty()).then(|| (key.to_string(), v))
            })
            .collect();
        let asset_root = PathBuf::from(env_opt("ASSET_ROOT").unwrap_or_else(|| "./assets".into()));
        let staging_dir = env_opt("ASSET_STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("catalog-sync"));
        Self {
            store_url: env_opt("SYNC_STORE_DB_URL").or_else(|| env_opt("DATABASE_URL")),
            store_max_connections: env_parse("SYNC_STORE_MAX_CONNS", 4u32),
            profiles,
            default_profile: env_opt(PROFILE_VAR),
            default_prefix: env_opt("CATALOG_DEFAULT_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            connect_timeout: Duration::from_secs(env_parse("CATALOG_CONNECT_TIMEOUT_SECS", 10u64)),
            download_timeout: Duration::from_secs(env_parse("ASSET_DOWNLOAD_TIMEOUT_SECS", 30u64)),
            asset_root,
            staging_dir,
        }
    }

    /// Target DSN for a catalog key: its own profile, else the default one.
    pub fn profile_url(&self, catalog_key: &str) -> Option<&str> {
        self.profiles
            .get(&profile_key(catalog_key))
            .or(self.default_profile.as_ref())
            .map(String::as_str)
    }
}
