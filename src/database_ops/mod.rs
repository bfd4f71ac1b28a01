pub mod inspect;
pub mod schema_cache;
pub mod store;
pub mod target;
pub mod transfer;
