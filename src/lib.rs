//! ds3pool - DS3 bulk data-movement client

pub mod cli;
pub mod config;
pub mod ds3;

pub use config::Config;
pub use ds3::{BulkOrchestrator, Ds3Client, Ds3Error};
