//! Worker configuration: YAML or JSON, validated against the embedded schema.

pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str, load_config_from_yaml, validate_config};
pub use schema::{
    AppConfig, IngestionSettings, LogFormat, LoggingConfig, OutlookConfig, StorageConfig,
    SyncConfig, WorkersConfig,
};
