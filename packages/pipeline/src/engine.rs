use std::path::{Path, PathBuf};
use std::sync::Arc;

use catalog::AssetRegistry;
use common::{AssetType, RemoteKind, Scope};
use tracing::info;

use crate::config::EngineConfig;
use crate::discovery::{self, IngestReport};
use crate::download::{DownloadReport, Downloader};
use crate::error::Result;
use crate::executor::{PipelineExecutor, SweepOptions, SweepSummary};
use crate::graph::TypeGraph;
use crate::layout::SiteLayout;
use crate::sink::{PayloadSink, TabularStore};

/// Registry, downloader and executor wired from one configuration.
#[derive(Clone)]
pub struct Engine {
    pub registry: AssetRegistry,
    pub layout: SiteLayout,
    pub downloader: Downloader,
    pub executor: PipelineExecutor,
}

impl Engine {
    pub async fn from_config(
        config: &EngineConfig,
        graph: TypeGraph,
        store: Arc<dyn TabularStore>,
    ) -> Result<Self> {
        let registry = AssetRegistry::connect(&config.catalog).await?;
        let layout = SiteLayout::new(&config.pipeline.data_root);
        let downloader =
            Downloader::from_config(registry.clone(), layout.clone(), &config.download)?;
        Ok(Self::assemble(
            registry,
            layout,
            downloader,
            graph,
            store,
            config.pipeline.effective_workers(),
        ))
    }

    /// Build from parts; used when the downloader needs custom fetchers.
    pub fn assemble(
        registry: AssetRegistry,
        layout: SiteLayout,
        downloader: Downloader,
        graph: TypeGraph,
        store: Arc<dyn TabularStore>,
        workers: usize,
    ) -> Self {
        let sink = PayloadSink::new(layout.clone(), store);
        let executor = PipelineExecutor::new(
            registry.clone(),
            Arc::new(graph),
            sink,
            layout.clone(),
            workers,
        );
        info!(root = %layout.root().display(), workers, "Engine ready");
        Self {
            registry,
            layout,
            downloader,
            executor,
        }
    }

    /// Register every recognisable file under `dir`.
    pub async fn ingest_directory(&self, scope: &Scope, dir: &Path) -> Result<IngestReport> {
        let files = discovery::scan_directory(dir).await?;
        discovery::ingest_local(&self.registry, scope, &files).await
    }

    pub async fn ingest_files(&self, scope: &Scope, paths: &[PathBuf]) -> Result<IngestReport> {
        discovery::ingest_local(&self.registry, scope, paths).await
    }

    pub async fn ingest_remote(
        &self,
        scope: &Scope,
        remote_paths: &[String],
        kind: RemoteKind,
    ) -> Result<IngestReport> {
        discovery::ingest_remote(&self.registry, scope, remote_paths, kind).await
    }

    /// Fetch remote assets of `types` that are missing locally.
    pub async fn download(
        &self,
        scope: &Scope,
        types: &[AssetType],
        override_existing: bool,
    ) -> Result<DownloadReport> {
        let planned = self
            .downloader
            .plan_download(scope, types, override_existing)
            .await?;
        self.downloader.download(planned).await
    }

    pub async fn process(
        &self,
        scope: &Scope,
        target: AssetType,
        opts: &SweepOptions,
    ) -> Result<SweepSummary> {
        self.executor.sweep(scope, target, opts).await
    }
}
