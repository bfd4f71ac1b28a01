use thiserror::Error;

use crate::normalization::field_spec::SpecError;

/// Failures that abort a whole run. Row-level problems never surface here; they go to the
/// audit sink instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no target connection profile for catalog `{0}`")]
    ProfileUnresolved(String),

    #[error("could not connect to target catalog: {0}")]
    Connect(#[source] anyhow::Error),

    #[error("entity {0} does not exist in the target catalog")]
    EntityNotFound(i64),

    #[error("`{0}` cannot hold this entity: it needs a mapping entry and a single generated key")]
    EntityTableUnusable(String),

    #[error("the entity row in `{0}` was not written")]
    EntityRowMissing(String),

    #[error("mapping for {catalog_key}/{category} is invalid: {source}")]
    MappingInvalid {
        catalog_key: String,
        category: String,
        #[source]
        source: SpecError,
    },

    #[error("no mapping found for {0}/{1}")]
    MappingMissing(String, String),

    #[error("run {0} not found")]
    RunNotFound(i64),

    #[error("mapping store failed: {0}")]
    Store(#[source] anyhow::Error),

    #[error("target catalog failed: {0}")]
    Target(#[source] anyhow::Error),
}

impl SyncError {
    /// Stable identifier surfaced to callers alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::ProfileUnresolved(_) => "profile_unresolved",
            SyncError::Connect(_) => "connect_failed",
            SyncError::EntityNotFound(_) => "entity_not_found",
            SyncError::EntityTableUnusable(_) => "entity_table_unusable",
            SyncError::EntityRowMissing(_) => "entity_row_missing",
            SyncError::MappingInvalid { .. } => "mapping_invalid",
            SyncError::MappingMissing(..) => "mapping_missing",
            SyncError::RunNotFound(_) => "run_not_found",
            SyncError::Store(_) => "store_failed",
            SyncError::Target(_) => "target_failed",
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
