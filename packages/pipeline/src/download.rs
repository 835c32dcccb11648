use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catalog::{AssetRecord, AssetRegistry};
use common::config::DownloadConfig;
use common::{AssetType, RemoteKind, Scope};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::layout::SiteLayout;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Operator-actionable; the backend message is kept verbatim.
    #[error("Authentication failed for {remote_path}: {message}")]
    Auth {
        remote_path: String,
        message: String,
    },

    #[error("Network error fetching {remote_path}: {message}")]
    Network {
        remote_path: String,
        message: String,
    },

    #[error("Remote object not found: {0}")]
    NotFound(String),

    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    #[error("No fetcher configured for {0} assets")]
    NoBackend(RemoteKind),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DownloadErrorKind {
    Auth,
    Network,
    NotFound,
    Invalid,
    Io,
}

impl DownloadError {
    pub fn kind(&self) -> DownloadErrorKind {
        match self {
            Self::Auth { .. } => DownloadErrorKind::Auth,
            Self::Network { .. } => DownloadErrorKind::Network,
            Self::NotFound(_) => DownloadErrorKind::NotFound,
            Self::InvalidRemotePath(_) | Self::NoBackend(_) => DownloadErrorKind::Invalid,
            Self::Io(_) => DownloadErrorKind::Io,
        }
    }

    /// Classify an HTTP status from either backend.
    fn from_status(status: u16, remote_path: &str, body: String) -> Self {
        match status {
            401 | 403 => Self::Auth {
                remote_path: remote_path.to_string(),
                message: body,
            },
            404 => Self::NotFound(remote_path.to_string()),
            _ => Self::Network {
                remote_path: remote_path.to_string(),
                message: format!("HTTP {status}: {body}"),
            },
        }
    }
}

/// Fetches one remote object into a local directory.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Download `remote_path` into `dest_dir` and return the local file path.
    async fn fetch(&self, remote_path: &str, dest_dir: &Path) -> Result<PathBuf, DownloadError>;
}

/// Last path segment of a remote reference, used as the local file name.
pub fn file_name_of(remote_path: &str) -> Option<&str> {
    remote_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
}

fn temp_path(dest_dir: &Path) -> PathBuf {
    dest_dir.join(".tmp").join(uuid::Uuid::new_v4().to_string())
}

async fn finish(temp: &Path, dest: &Path) -> Result<(), DownloadError> {
    if let Err(e) = fs::rename(temp, dest).await {
        let _ = fs::remove_file(temp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Object-store fetcher for `s3://bucket/key` references.
pub struct S3Fetcher {
    region: Region,
    credentials: Credentials,
    path_style: bool,
}

impl S3Fetcher {
    /// Credentials come from the environment or profile; without any, the
    /// fetcher reads public buckets anonymously.
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let region = match &config.s3_endpoint {
            Some(endpoint) => Region::Custom {
                region: config.s3_region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .s3_region
                .parse()
                .map_err(|e| PipelineError::Backend(format!("invalid S3 region: {e}")))?,
        };
        let credentials = Credentials::default()
            .or_else(|_| Credentials::anonymous())
            .map_err(|e| PipelineError::Backend(format!("S3 credentials: {e}")))?;

        Ok(Self {
            region,
            credentials,
            path_style: config.s3_endpoint.is_some(),
        })
    }

    /// Split `s3://bucket/key` (or `bucket/key`) into its parts.
    pub fn split(remote_path: &str) -> Option<(&str, &str)> {
        let rest = remote_path.strip_prefix("s3://").unwrap_or(remote_path);
        let (bucket, key) = rest.split_once('/')?;
        (!bucket.is_empty() && !key.is_empty()).then_some((bucket, key))
    }

    fn map_err(remote_path: &str, e: S3Error) -> DownloadError {
        match e {
            S3Error::HttpFailWithBody(status, body) => {
                DownloadError::from_status(status, remote_path, body)
            }
            S3Error::Credentials(e) => DownloadError::Auth {
                remote_path: remote_path.to_string(),
                message: e.to_string(),
            },
            S3Error::Io(e) => DownloadError::Io(e),
            other => DownloadError::Network {
                remote_path: remote_path.to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl RemoteFetcher for S3Fetcher {
    async fn fetch(&self, remote_path: &str, dest_dir: &Path) -> Result<PathBuf, DownloadError> {
        let (bucket_name, key) = Self::split(remote_path)
            .ok_or_else(|| DownloadError::InvalidRemotePath(remote_path.to_string()))?;
        let name = file_name_of(key)
            .ok_or_else(|| DownloadError::InvalidRemotePath(remote_path.to_string()))?;

        let mut bucket = Bucket::new(bucket_name, self.region.clone(), self.credentials.clone())
            .map_err(|e| Self::map_err(remote_path, e))?;
        if self.path_style {
            bucket = bucket.with_path_style();
        }

        fs::create_dir_all(dest_dir.join(".tmp")).await?;
        let temp = temp_path(dest_dir);
        let mut file = fs::File::create(&temp).await?;

        let status = match bucket.get_object_to_writer(key, &mut file).await {
            Ok(status) => status,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&temp).await;
                return Err(Self::map_err(remote_path, e));
            }
        };
        file.flush().await?;
        drop(file);

        if !(200..300).contains(&status) {
            let _ = fs::remove_file(&temp).await;
            return Err(DownloadError::from_status(status, remote_path, String::new()));
        }

        let dest = dest_dir.join(name);
        finish(&temp, &dest).await?;
        Ok(dest)
    }
}

/// HTTP(S) archive fetcher with optional bearer-token authentication.
pub struct HttpFetcher {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpFetcher {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Backend(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            token: config.http_token.clone(),
        })
    }

    fn network(remote_path: &str, e: reqwest::Error) -> DownloadError {
        DownloadError::Network {
            remote_path: remote_path.to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, remote_path: &str, dest_dir: &Path) -> Result<PathBuf, DownloadError> {
        if !remote_path.starts_with("http://") && !remote_path.starts_with("https://") {
            return Err(DownloadError::InvalidRemotePath(remote_path.to_string()));
        }
        let name = file_name_of(remote_path)
            .ok_or_else(|| DownloadError::InvalidRemotePath(remote_path.to_string()))?;

        let mut request = self.client.get(remote_path);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let mut response = request
            .send()
            .await
            .map_err(|e| Self::network(remote_path, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DownloadError::from_status(status.as_u16(), remote_path, body));
        }

        fs::create_dir_all(dest_dir.join(".tmp")).await?;
        let temp = temp_path(dest_dir);
        let mut file = fs::File::create(&temp).await?;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => file.write_all(&chunk).await?,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&temp).await;
                    return Err(Self::network(remote_path, e));
                }
            }
        }
        file.flush().await?;
        drop(file);

        let dest = dest_dir.join(name);
        finish(&temp, &dest).await?;
        Ok(dest)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadedAsset {
    pub id: i32,
    pub local_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadFailure {
    pub id: i32,
    pub remote_path: Option<String>,
    pub kind: DownloadErrorKind,
    pub message: String,
}

/// Per-asset outcome of a download batch. Completion order is arbitrary.
#[derive(Clone, Debug, Default)]
pub struct DownloadReport {
    pub succeeded: Vec<DownloadedAsset>,
    pub failed: Vec<DownloadFailure>,
}

impl DownloadReport {
    pub fn failed_ids(&self) -> Vec<i32> {
        let mut ids: Vec<_> = self.failed.iter().map(|f| f.id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: DownloadReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}

/// Resolves remote assets that are missing locally and fetches them with
/// bounded concurrency.
#[derive(Clone)]
pub struct Downloader {
    registry: AssetRegistry,
    layout: SiteLayout,
    fetchers: HashMap<RemoteKind, Arc<dyn RemoteFetcher>>,
    semaphore: Arc<Semaphore>,
}

impl Downloader {
    pub fn new(registry: AssetRegistry, layout: SiteLayout, max_concurrent: usize) -> Self {
        Self {
            registry,
            layout,
            fetchers: HashMap::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// S3 and HTTP fetchers built from `config`.
    pub fn from_config(
        registry: AssetRegistry,
        layout: SiteLayout,
        config: &DownloadConfig,
    ) -> Result<Self> {
        Ok(Self::new(registry, layout, config.max_concurrent)
            .with_fetcher(RemoteKind::S3, Arc::new(S3Fetcher::new(config)?))
            .with_fetcher(RemoteKind::Http, Arc::new(HttpFetcher::new(config)?)))
    }

    pub fn with_fetcher(mut self, kind: RemoteKind, fetcher: Arc<dyn RemoteFetcher>) -> Self {
        self.fetchers.insert(kind, fetcher);
        self
    }

    /// Remote assets of `types` in `scope` that need fetching: no local path,
    /// or a local path whose file is gone. With `override_existing`, every
    /// remote asset of those types.
    pub async fn plan_download(
        &self,
        scope: &Scope,
        types: &[AssetType],
        override_existing: bool,
    ) -> Result<Vec<AssetRecord>> {
        let mut planned = Vec::new();
        for asset_type in types {
            let records = self.registry.query(scope, Some(*asset_type)).await?;
            planned.extend(records.into_iter().filter(|r| {
                r.remote_path.is_some() && (override_existing || !r.has_local_file())
            }));
        }
        info!(%scope, count = planned.len(), "Download planned");
        Ok(planned)
    }

    pub async fn download_ids(&self, ids: &[i32]) -> Result<DownloadReport> {
        let records = self.registry.get_many(ids).await?;
        self.download(records).await
    }

    /// Fetch every record, partitioned by remote kind.
    ///
    /// Per-asset failures land in the report; only a registry failure aborts
    /// the batch. Each success is written to the registry as soon as the file
    /// is in place.
    pub async fn download(&self, records: Vec<AssetRecord>) -> Result<DownloadReport> {
        let mut report = DownloadReport::default();
        let mut partitions: Vec<(RemoteKind, Vec<AssetRecord>)> = Vec::new();

        for record in records {
            let Some(kind) = record.remote_kind.filter(|_| record.remote_path.is_some()) else {
                report.failed.push(Self::failure(
                    &record,
                    &DownloadError::InvalidRemotePath(record.describe()),
                ));
                continue;
            };
            match partitions.iter_mut().find(|(k, _)| *k == kind) {
                Some((_, batch)) => batch.push(record),
                None => partitions.push((kind, vec![record])),
            }
        }

        for (kind, batch) in partitions {
            let Some(fetcher) = self.fetchers.get(&kind).cloned() else {
                warn!(%kind, count = batch.len(), "No fetcher configured, skipping");
                for record in &batch {
                    report
                        .failed
                        .push(Self::failure(record, &DownloadError::NoBackend(kind)));
                }
                continue;
            };
            info!(%kind, count = batch.len(), "Downloading");
            report.merge(self.download_partition(fetcher, batch).await?);
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Download batch finished"
        );
        Ok(report)
    }

    async fn download_partition(
        &self,
        fetcher: Arc<dyn RemoteFetcher>,
        batch: Vec<AssetRecord>,
    ) -> Result<DownloadReport> {
        let mut set = JoinSet::new();

        for record in batch {
            let fetcher = Arc::clone(&fetcher);
            let registry = self.registry.clone();
            let semaphore = Arc::clone(&self.semaphore);
            let dest_dir = self.layout.raw_dir(&record.scope);
            set.spawn(fetch_one(fetcher, registry, semaphore, record, dest_dir));
        }

        let mut report = DownloadReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(Ok(done))) => report.succeeded.push(done),
                Ok(Ok(Err(failure))) => report.failed.push(failure),
                Ok(Err(fatal)) => {
                    set.abort_all();
                    return Err(fatal);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    set.abort_all();
                    return Err(e.into());
                }
            }
        }
        Ok(report)
    }

    fn failure(record: &AssetRecord, e: &DownloadError) -> DownloadFailure {
        match e.kind() {
            DownloadErrorKind::Auth => error!(asset_id = record.id, "{}", e),
            _ => warn!(asset_id = record.id, asset = %record.describe(), "Download failed: {}", e),
        }
        DownloadFailure {
            id: record.id,
            remote_path: record.remote_path.clone(),
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Fetch one asset under a concurrency permit. The outer error is a
/// registry failure; the inner one is this asset's own outcome.
async fn fetch_one(
    fetcher: Arc<dyn RemoteFetcher>,
    registry: AssetRegistry,
    semaphore: Arc<Semaphore>,
    record: AssetRecord,
    dest_dir: PathBuf,
) -> Result<std::result::Result<DownloadedAsset, DownloadFailure>> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| PipelineError::Backend(e.to_string()))?;

    let remote_path = record.remote_path.clone().unwrap_or_default();
    debug!(asset_id = record.id, %remote_path, "Fetching");
    match fetcher.fetch(&remote_path, &dest_dir).await {
        Ok(local_path) => {
            registry.update_local_path(record.id, &local_path).await?;
            debug!(asset_id = record.id, local_path = %local_path.display(), "Fetched");
            Ok(Ok(DownloadedAsset {
                id: record.id,
                local_path,
            }))
        }
        Err(e) => Ok(Err(Downloader::failure(&record, &e))),
    }
}
