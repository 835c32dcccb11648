use catalog::CatalogError;
use thiserror::Error;

use crate::graph::GraphError;

/// Infrastructure failures that abort the current operation.
///
/// Business conditions (no candidates, already processed, a failing
/// transform or download) never surface here; they are summary counts.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Type graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download backend error: {0}")]
    Backend(String),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
