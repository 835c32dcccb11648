pub mod database;
pub mod entity;
pub mod error;
pub mod record;
pub mod registry;

pub use error::{CatalogError, Result};
pub use record::{AssetRecord, NewAsset};
pub use registry::{AssetRegistry, parent_key};
