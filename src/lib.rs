pub mod database_ops;
pub mod normalization;
pub mod telemetry;

pub mod util {
    pub mod config;
    pub mod db;
    pub mod env;
}
