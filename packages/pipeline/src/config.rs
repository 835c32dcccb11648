use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub use common::config::{CatalogConfig, DownloadConfig, PipelineConfig};

/// Engine configuration, assembled from defaults, an optional file and `SFG__*` variables.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl EngineConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("SFG_CONFIG").unwrap_or_else(|_| "config/config".to_string());
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("catalog.url", "sqlite://sfg_catalog.db?mode=rwc")?
            .set_default("catalog.max_connections", 5_i64)?
            .set_default("catalog.sqlx_logging", false)?
            .set_default("download.max_concurrent", 10_i64)?
            .set_default("download.s3_region", "us-east-2")?
            .set_default("download.http_timeout_secs", 300_i64)?
            .set_default("pipeline.data_root", "./sfg_data")?
            .set_default("pipeline.max_workers", 0_i64)?
            .add_source(File::with_name(config_path).required(false))
            .add_source(Environment::with_prefix("SFG").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
