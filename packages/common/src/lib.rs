pub mod asset;
pub mod config;
pub mod telemetry;

pub use asset::{AssetCategory, AssetType, ParseAssetTypeError, RemoteKind, Scope, TimeBounds};
