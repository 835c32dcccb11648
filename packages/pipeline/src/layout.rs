use std::path::{Path, PathBuf};

use common::Scope;
use tokio::fs;

/// Per-site directory tree under the data root:
/// `{root}/{network}/{station}/{survey}/{raw,intermediate,processed}`.
#[derive(Clone, Debug)]
pub struct SiteLayout {
    root: PathBuf,
}

impl SiteLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn survey_dir(&self, scope: &Scope) -> PathBuf {
        self.root
            .join(&scope.network)
            .join(&scope.station)
            .join(&scope.survey)
    }

    /// Downloaded and ingested source files.
    pub fn raw_dir(&self, scope: &Scope) -> PathBuf {
        self.survey_dir(scope).join("raw")
    }

    /// File-category outputs (RINEX, kinematic solutions).
    pub fn intermediate_dir(&self, scope: &Scope) -> PathBuf {
        self.survey_dir(scope).join("intermediate")
    }

    /// Tabular copies and side-car documents.
    pub fn processed_dir(&self, scope: &Scope) -> PathBuf {
        self.survey_dir(scope).join("processed")
    }

    /// Create the three working directories for `scope`.
    pub async fn ensure(&self, scope: &Scope) -> std::io::Result<()> {
        for dir in [
            self.raw_dir(scope),
            self.intermediate_dir(scope),
            self.processed_dir(scope),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}
