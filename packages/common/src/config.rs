use std::path::PathBuf;

use serde::Deserialize;

/// Asset catalog database settings.
#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    /// Database URL. Default: "sqlite://sfg_catalog.db?mode=rwc".
    #[serde(default = "default_catalog_url")]
    pub url: String,
    /// Connection pool size. Default: 5.
    #[serde(default = "default_catalog_max_connections")]
    pub max_connections: u32,
    /// Log every SQL statement. Default: false.
    #[serde(default)]
    pub sqlx_logging: bool,
}

fn default_catalog_url() -> String {
    "sqlite://sfg_catalog.db?mode=rwc".into()
}
fn default_catalog_max_connections() -> u32 {
    5
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: default_catalog_url(),
            max_connections: default_catalog_max_connections(),
            sqlx_logging: false,
        }
    }
}

/// Remote asset download settings.
#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    /// Maximum number of transfers in flight. Default: 10.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Object store region. Default: "us-east-2".
    #[serde(default = "default_s3_region")]
    pub s3_region: String,
    /// Custom object store endpoint (MinIO, localstack). Default: none.
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    /// Bearer token sent with HTTP archive requests. Default: none.
    #[serde(default)]
    pub http_token: Option<String>,
    /// Per-request HTTP timeout in seconds. Default: 300.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    10
}
fn default_s3_region() -> String {
    "us-east-2".into()
}
fn default_http_timeout_secs() -> u64 {
    300
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            s3_region: default_s3_region(),
            s3_endpoint: None,
            http_token: None,
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

/// Processing settings.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Root of the per-site directory tree. Default: "./sfg_data".
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Concurrent transform workers; 0 means one per available core. Default: 0.
    #[serde(default)]
    pub max_workers: usize,
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./sfg_data")
}

impl PipelineConfig {
    /// Worker count with the "one per core" default resolved.
    pub fn effective_workers(&self) -> usize {
        if self.max_workers > 0 {
            return self.max_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            max_workers: 0,
        }
    }
}
