use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use common::{AssetCategory, AssetType, TimeBounds};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::layout::SiteLayout;
use crate::payload::{DerivedPayload, Table, TableRow};
use crate::transform::Candidate;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{target} expects a {expected} payload, transform returned {actual}")]
    CategoryMismatch {
        target: AssetType,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{0} is not a derivable asset type")]
    NotDerivable(AssetType),

    #[error("Transform reported output {0} but it does not exist")]
    MissingOutput(PathBuf),

    #[error("Transform produced an empty table")]
    EmptyTable,

    #[error("Tabular store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Time-indexed array store, one logical stream per derived type.
///
/// Implementations must accept concurrent writes from several transform workers.
#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn write(&self, stream: &str, table: &Table) -> Result<(), SinkError>;

    async fn read_range(
        &self,
        stream: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Table, SinkError>;

    /// Distinct calendar days already present in `stream`.
    async fn dates(&self, stream: &str) -> Result<Vec<NaiveDate>, SinkError>;
}

/// In-process store, suitable for tests and short-lived runs.
#[derive(Default)]
pub struct MemoryTabularStore {
    streams: RwLock<HashMap<String, Vec<TableRow>>>,
}

impl MemoryTabularStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row_count(&self, stream: &str) -> usize {
        self.streams.read().await.get(stream).map_or(0, Vec::len)
    }
}

#[async_trait]
impl TabularStore for MemoryTabularStore {
    async fn write(&self, stream: &str, table: &Table) -> Result<(), SinkError> {
        let mut streams = self.streams.write().await;
        let rows = streams.entry(stream.to_string()).or_default();
        rows.extend(table.rows.iter().cloned());
        rows.sort_by_key(|r| r.time);
        Ok(())
    }

    async fn read_range(
        &self,
        stream: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Table, SinkError> {
        let streams = self.streams.read().await;
        let table = streams
            .get(stream)
            .map(|rows| Table::new(rows.clone()).range(start, end))
            .unwrap_or_default();
        Ok(table)
    }

    async fn dates(&self, stream: &str) -> Result<Vec<NaiveDate>, SinkError> {
        let streams = self.streams.read().await;
        let days: BTreeSet<NaiveDate> = streams
            .get(stream)
            .map(|rows| rows.iter().map(|r| r.time.date_naive()).collect())
            .unwrap_or_default();
        Ok(days.into_iter().collect())
    }
}

/// Where a payload ended up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredPayload {
    pub local_path: PathBuf,
    pub bounds: Option<TimeBounds>,
}

/// Routes a derived payload to the sink its target's category calls for.
#[derive(Clone)]
pub struct PayloadSink {
    layout: SiteLayout,
    store: Arc<dyn TabularStore>,
}

impl PayloadSink {
    pub fn new(layout: SiteLayout, store: Arc<dyn TabularStore>) -> Self {
        Self { layout, store }
    }

    pub fn store(&self) -> &Arc<dyn TabularStore> {
        &self.store
    }

    pub async fn persist(
        &self,
        candidate: &Candidate,
        target: AssetType,
        payload: DerivedPayload,
    ) -> Result<StoredPayload, SinkError> {
        let processed = self.layout.processed_dir(candidate.scope());
        let label = candidate.label();

        match (target.category(), payload) {
            (AssetCategory::Tabular, DerivedPayload::Table(table)) => {
                let bounds = table.time_bounds().ok_or(SinkError::EmptyTable)?;
                let name = format!(
                    "{label}_{target}_{}.jsonl",
                    bounds.start.format("%Y-%m-%d")
                );
                let path = processed.join(name);

                let mut body = Vec::new();
                for row in &table.rows {
                    serde_json::to_writer(&mut body, row)?;
                    body.push(b'\n');
                }
                write_atomic(&path, &body).await?;
                self.store.write(target.as_str(), &table).await?;

                debug!(rows = table.len(), path = %path.display(), "Tabular payload stored");
                Ok(StoredPayload {
                    local_path: path,
                    bounds: Some(bounds),
                })
            }
            (AssetCategory::SideCar, DerivedPayload::SideCar { document, bounds }) => {
                let path = processed.join(format!("{label}_{target}.json"));
                let body = serde_json::to_vec_pretty(&document)?;
                write_atomic(&path, &body).await?;

                debug!(path = %path.display(), "Side-car stored");
                Ok(StoredPayload {
                    local_path: path,
                    bounds,
                })
            }
            (AssetCategory::File, DerivedPayload::File { path, bounds }) => {
                if !fs::try_exists(&path).await? {
                    return Err(SinkError::MissingOutput(path));
                }
                Ok(StoredPayload {
                    local_path: path,
                    bounds,
                })
            }
            (AssetCategory::Raw, _) => Err(SinkError::NotDerivable(target)),
            (category, payload) => Err(SinkError::CategoryMismatch {
                target,
                expected: match category {
                    AssetCategory::Tabular => "table",
                    AssetCategory::SideCar => "side-car",
                    _ => "file",
                },
                actual: payload.kind(),
            }),
        }
    }
}

/// Write `data` to a temp file beside `path`, then rename it into place.
pub async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_dir = dir.join(".tmp");
    fs::create_dir_all(&tmp_dir).await?;
    let temp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());

    if let Err(e) = fs::write(&temp_path, data).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e);
    }
    Ok(())
}
