pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;

pub use adapters::{RedshiftWarehouse, S3Storage};
pub use config::EtlConfig;
pub use core::etl::{EngineSettings, EtlEngine};
pub use utils::error::{EtlError, Result, RunFailure};
