pub mod config;
pub mod discovery;
pub mod download;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod layout;
pub mod payload;
pub mod sink;
pub mod transform;

pub use config::EngineConfig;
pub use discovery::{IngestReport, classify_file_name};
pub use download::{
    DownloadError, DownloadErrorKind, DownloadReport, Downloader, HttpFetcher, RemoteFetcher,
    S3Fetcher,
};
pub use engine::Engine;
pub use error::{PipelineError, Result};
pub use executor::{PipelineExecutor, StepSummary, SweepOptions, SweepSummary};
pub use graph::{GraphError, STANDARD_LINKS, Step, TypeGraph};
pub use layout::SiteLayout;
pub use payload::{DerivedPayload, Table, TableRow};
pub use sink::{MemoryTabularStore, PayloadSink, SinkError, TabularStore};
pub use transform::{
    BatchAsset, Candidate, NativeTransform, Transform, TransformContext, TransformMode,
};
