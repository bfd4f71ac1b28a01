//! Record-to-catalog transfer: mapping resolution, the core entity and its dependent
//! pipelines.
pub mod assets;
pub mod audit;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
pub mod fanout;
pub mod features;
pub mod generic;
pub mod mapping;
pub mod precedence;
pub mod rows;
pub mod scope;
pub mod variants;

pub use engine::{run_transfer, sync_run, RunOptions, RunRequest, TransferSummary};
pub use error::{SyncError, SyncResult};
