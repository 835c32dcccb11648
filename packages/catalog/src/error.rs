use sea_orm::DbErr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    /// An asset with the same remote path already exists in this scope and type.
    #[error("Duplicate asset: {remote_path}")]
    Duplicate { remote_path: String },

    #[error("Asset {0} not found")]
    NotFound(i32),

    #[error("Invalid asset record: {0}")]
    InvalidRecord(String),

    /// The registry could not be read or written. Callers must not continue a
    /// sweep on this error.
    #[error("Catalog database error: {0}")]
    Database(#[from] DbErr),
}

impl CatalogError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
