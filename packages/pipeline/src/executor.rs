use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use catalog::{AssetRecord, AssetRegistry, NewAsset};
use common::{AssetCategory, AssetType, Scope};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::graph::{Step, TypeGraph};
use crate::layout::SiteLayout;
use crate::payload::DerivedPayload;
use crate::sink::PayloadSink;
use crate::transform::{BatchAsset, Candidate, TransformContext, TransformMode};

/// Per-sweep switches.
#[derive(Clone, Debug, Default)]
pub struct SweepOptions {
    /// Reprocess candidates that already have a link to the target.
    pub override_existing: bool,
    /// Checked between steps only; a running step always finishes.
    pub deadline: Option<Instant>,
}

impl SweepOptions {
    pub fn override_existing() -> Self {
        Self {
            override_existing: true,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CandidateFailure {
    pub asset_ids: Vec<i32>,
    pub error: String,
}

/// Outcome counts for one `(source, target)` step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub source: AssetType,
    pub target: AssetType,
    /// `None` when no transform is registered for the pair.
    pub transform: Option<String>,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped_done: usize,
    pub skipped_no_transform: usize,
    /// Source assets whose bytes are not on disk yet.
    pub skipped_not_local: usize,
    pub failed: usize,
    pub failures: Vec<CandidateFailure>,
    /// Ids of the derived assets this step registered.
    pub produced: Vec<i32>,
}

impl StepSummary {
    fn new(source: AssetType, target: AssetType, transform: Option<String>) -> Self {
        Self {
            source,
            target,
            transform,
            attempted: 0,
            succeeded: 0,
            skipped_done: 0,
            skipped_no_transform: 0,
            skipped_not_local: 0,
            failed: 0,
            failures: Vec::new(),
            produced: Vec::new(),
        }
    }

    fn fail(&mut self, candidate: &Candidate, error: String) {
        warn!(
            candidate = %candidate,
            source = %self.source,
            target = %self.target,
            error = %error,
            "Transform failed"
        );
        self.failed += 1;
        self.failures.push(CandidateFailure {
            asset_ids: candidate.ids(),
            error,
        });
    }
}

/// Structured result of a sweep. Returned even when candidates failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub scope: Scope,
    pub steps: Vec<StepSummary>,
    /// Requested types nothing in the graph produces.
    pub unresolved: Vec<AssetType>,
    /// The deadline passed before every step ran.
    pub cancelled: bool,
    /// Steps not started because of the deadline.
    pub pending: Vec<(AssetType, AssetType)>,
}

impl SweepSummary {
    fn new(scope: &Scope) -> Self {
        Self {
            scope: scope.clone(),
            steps: Vec::new(),
            unresolved: Vec::new(),
            cancelled: false,
            pending: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.steps.iter().map(|s| s.succeeded).sum()
    }

    pub fn failed(&self) -> usize {
        self.steps.iter().map(|s| s.failed).sum()
    }

    /// Every source asset id that took part in a failed candidate.
    pub fn failed_asset_ids(&self) -> Vec<i32> {
        let ids: BTreeSet<i32> = self
            .steps
            .iter()
            .flat_map(|s| s.failures.iter())
            .flat_map(|f| f.asset_ids.iter().copied())
            .collect();
        ids.into_iter().collect()
    }

    pub fn step(&self, source: AssetType, target: AssetType) -> Option<&StepSummary> {
        self.steps
            .iter()
            .find(|s| s.source == source && s.target == target)
    }
}

type ScopeLocks = Arc<std::sync::Mutex<HashMap<Scope, Arc<Mutex<()>>>>>;

/// Holds a scope's sweep lock; drops the map entry once nobody else wants it.
struct ScopeGuard {
    scope: Scope,
    locks: ScopeLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Waiters clone the Arc under this map lock, so a count of one is final.
        if locks.get(&self.scope).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.scope);
        }
    }
}

/// Walks the type graph for a scope, runs transforms and records results.
#[derive(Clone)]
pub struct PipelineExecutor {
    registry: AssetRegistry,
    graph: Arc<TypeGraph>,
    sink: PayloadSink,
    layout: SiteLayout,
    workers: Arc<Semaphore>,
    scope_locks: ScopeLocks,
    settings: serde_json::Value,
}

impl PipelineExecutor {
    pub fn new(
        registry: AssetRegistry,
        graph: Arc<TypeGraph>,
        sink: PayloadSink,
        layout: SiteLayout,
        max_workers: usize,
    ) -> Self {
        Self {
            registry,
            graph,
            sink,
            layout,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            scope_locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            settings: serde_json::Value::Null,
        }
    }

    /// Auxiliary configuration passed to every transform through its context.
    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn graph(&self) -> &TypeGraph {
        &self.graph
    }

    /// One sweep per scope at a time; a second caller waits.
    async fn lock_scope(&self, scope: &Scope) -> ScopeGuard {
        let lock = {
            let mut locks = self
                .scope_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(scope.clone()).or_default())
        };
        if lock.try_lock().is_err() {
            debug!(%scope, "Waiting for active sweep on scope");
        }
        ScopeGuard {
            scope: scope.clone(),
            locks: Arc::clone(&self.scope_locks),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Scopes with an active or waiting sweep.
    pub fn busy_scopes(&self) -> usize {
        self.scope_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Produce `target` for `scope`, running every step of its ancestor chain.
    pub async fn sweep(
        &self,
        scope: &Scope,
        target: AssetType,
        opts: &SweepOptions,
    ) -> Result<SweepSummary> {
        let _guard = self.lock_scope(scope).await;
        let mut summary = SweepSummary::new(scope);

        let steps = self.graph.steps_for(target);
        if steps.is_empty() {
            warn!(%scope, %target, "No transform chain produces target, skipping");
            summary.unresolved.push(target);
            return Ok(summary);
        }

        info!(
            %scope,
            %target,
            chain = ?self.graph.ancestor_chain(target),
            override_existing = opts.override_existing,
            "Sweep started"
        );
        self.run_steps(scope, steps, opts, &mut summary).await?;
        self.log_summary(&summary);
        Ok(summary)
    }

    /// Process everything derivable from `source`, level by level.
    pub async fn sweep_from(
        &self,
        scope: &Scope,
        source: AssetType,
        opts: &SweepOptions,
    ) -> Result<SweepSummary> {
        let _guard = self.lock_scope(scope).await;
        let mut summary = SweepSummary::new(scope);

        let steps = self.graph.steps_from(source);
        if steps.is_empty() {
            info!(%scope, %source, "Nothing derives from source type");
            return Ok(summary);
        }

        info!(
            %scope,
            %source,
            descendants = ?self.graph.descendant_types(source),
            "Forward sweep started"
        );
        self.run_steps(scope, steps, opts, &mut summary).await?;
        self.log_summary(&summary);
        Ok(summary)
    }

    /// Run the single `source -> target` link.
    pub async fn sweep_link(
        &self,
        scope: &Scope,
        source: AssetType,
        target: AssetType,
        opts: &SweepOptions,
    ) -> Result<SweepSummary> {
        let _guard = self.lock_scope(scope).await;
        let mut summary = SweepSummary::new(scope);

        match self.graph.get(source, target).cloned() {
            Some(step) => {
                self.run_steps(scope, vec![step], opts, &mut summary)
                    .await?;
            }
            None => {
                let candidates = self.registry.query(scope, Some(source)).await?.len();
                warn!(
                    %scope,
                    %source,
                    %target,
                    candidates,
                    "No transform registered, skipping"
                );
                let mut step = StepSummary::new(source, target, None);
                step.skipped_no_transform = candidates;
                summary.steps.push(step);
            }
        }
        self.log_summary(&summary);
        Ok(summary)
    }

    /// Re-run exactly the failed candidates of an earlier sweep.
    pub async fn retry_failed(
        &self,
        previous: &SweepSummary,
        opts: &SweepOptions,
    ) -> Result<SweepSummary> {
        let scope = &previous.scope;
        let _guard = self.lock_scope(scope).await;
        let mut summary = SweepSummary::new(scope);

        for failed in previous.steps.iter().filter(|s| !s.failures.is_empty()) {
            let Some(step) = self.graph.get(failed.source, failed.target).cloned() else {
                warn!(
                    source = %failed.source,
                    target = %failed.target,
                    "Transform no longer registered"
                );
                continue;
            };
            let only: BTreeSet<i32> = failed
                .failures
                .iter()
                .flat_map(|f| f.asset_ids.iter().copied())
                .collect();
            info!(%scope, %step, retrying = only.len(), "Retrying failed candidates");
            summary
                .steps
                .push(self.run_step(scope, &step, opts, Some(&only)).await?);
        }
        self.log_summary(&summary);
        Ok(summary)
    }

    async fn run_steps(
        &self,
        scope: &Scope,
        steps: Vec<Step>,
        opts: &SweepOptions,
        summary: &mut SweepSummary,
    ) -> Result<()> {
        self.layout.ensure(scope).await?;

        for (i, step) in steps.iter().enumerate() {
            if opts.expired() {
                summary.cancelled = true;
                summary.pending = steps[i..].iter().map(|s| (s.source, s.target)).collect();
                warn!(
                    %scope,
                    pending = summary.pending.len(),
                    "Deadline passed, stopping sweep"
                );
                break;
            }
            summary.steps.push(self.run_step(scope, step, opts, None).await?);
        }
        Ok(())
    }

    /// Candidates for `step` that still need processing.
    async fn candidates(
        &self,
        scope: &Scope,
        step: &Step,
        opts: &SweepOptions,
        only: Option<&BTreeSet<i32>>,
        summary: &mut StepSummary,
    ) -> Result<Vec<Candidate>> {
        let records = self.registry.query(scope, Some(step.source)).await?;
        let mut pending: Vec<AssetRecord> = Vec::new();

        for record in records {
            if only.is_some_and(|ids| !ids.contains(&record.id)) {
                continue;
            }
            if !opts.override_existing
                && self.registry.link_exists(record.id, step.target).await?
            {
                summary.skipped_done += 1;
                continue;
            }
            if !record.has_local_file() {
                debug!(asset = %record.describe(), "Source not available locally, skipping");
                summary.skipped_not_local += 1;
                continue;
            }
            pending.push(record);
        }

        Ok(match step.transform.mode() {
            TransformMode::Single => pending.into_iter().map(Candidate::Single).collect(),
            TransformMode::Batch if pending.is_empty() => Vec::new(),
            TransformMode::Batch => vec![Candidate::Batch(BatchAsset::new(
                scope.clone(),
                step.source,
                pending,
            ))],
        })
    }

    async fn run_step(
        &self,
        scope: &Scope,
        step: &Step,
        opts: &SweepOptions,
        only: Option<&BTreeSet<i32>>,
    ) -> Result<StepSummary> {
        let mut summary =
            StepSummary::new(step.source, step.target, Some(step.transform.name().to_string()));

        if step.target.category() == AssetCategory::Tabular {
            self.log_coverage(step.target).await;
        }

        let candidates = self.candidates(scope, step, opts, only, &mut summary).await?;
        summary.attempted = candidates.len();
        if candidates.is_empty() {
            debug!(%scope, %step, skipped = summary.skipped_done, "No candidates");
            return Ok(summary);
        }
        info!(%scope, %step, candidates = candidates.len(), "Running step");

        let ctx = Arc::new(TransformContext {
            scope: scope.clone(),
            target: step.target,
            intermediate_dir: self.layout.intermediate_dir(scope),
            processed_dir: self.layout.processed_dir(scope),
            settings: self.settings.clone(),
        });

        let mut set = JoinSet::new();
        for candidate in candidates {
            let transform = Arc::clone(&step.transform);
            let ctx = Arc::clone(&ctx);
            let workers = Arc::clone(&self.workers);
            set.spawn(async move {
                let outcome = match workers.acquire_owned().await {
                    Ok(_permit) => {
                        let input = candidate.clone();
                        tokio::task::spawn_blocking(move || transform.apply(&input, &ctx))
                            .await
                            .map_err(|e| {
                                if e.is_panic() {
                                    "transform panicked".to_string()
                                } else {
                                    e.to_string()
                                }
                            })
                            .and_then(|r| r.map_err(|e| format!("{e:#}")))
                    }
                    Err(e) => Err(e.to_string()),
                };
                (candidate, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (candidate, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(%step, "Transform task lost: {}", e);
                    set.abort_all();
                    return Err(PipelineError::Join(e));
                }
            };
            match outcome {
                Ok(payload) => {
                    if let Err(e) = self.record(step, &candidate, payload, &mut summary).await {
                        set.abort_all();
                        return Err(e);
                    }
                }
                Err(message) => summary.fail(&candidate, message),
            }
        }

        info!(
            %scope,
            %step,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped_done = summary.skipped_done,
            "Step finished"
        );
        Ok(summary)
    }

    /// Persist one successful payload and register its derived asset.
    ///
    /// A sink failure belongs to the candidate; a registry failure is returned.
    async fn record(
        &self,
        step: &Step,
        candidate: &Candidate,
        payload: DerivedPayload,
        summary: &mut StepSummary,
    ) -> Result<()> {
        let reported = payload.time_bounds();
        let stored = match self.sink.persist(candidate, step.target, payload).await {
            Ok(stored) => stored,
            Err(e) => {
                summary.fail(candidate, e.to_string());
                return Ok(());
            }
        };
        let bounds = stored.bounds.or_else(|| candidate.time_bounds());

        let entry = match candidate {
            Candidate::Single(parent) => NewAsset::derived(parent, step.target),
            Candidate::Batch(batch) => NewAsset::merged(batch.scope.clone(), step.target),
        }
        .with_local_path(&stored.local_path)
        .with_bounds(bounds);
        let id = self.registry.insert(entry).await?;

        match candidate {
            Candidate::Single(parent) => {
                self.registry.record_link(parent.id, step.target).await?;
                if let Some(b) = reported {
                    let widened = self.registry.widen_time_bounds(parent.id, b).await?;
                    debug!(
                        asset_id = parent.id,
                        start = %widened.start,
                        end = %widened.end,
                        "Parent bounds back-filled"
                    );
                }
            }
            Candidate::Batch(batch) => {
                self.registry
                    .record_batch_link(
                        &batch.scope,
                        batch.source_type,
                        step.target,
                        &candidate.ids(),
                    )
                    .await?;
            }
        }

        debug!(
            derived_id = id,
            parents = ?candidate.ids(),
            target = %step.target,
            local_path = %stored.local_path.display(),
            "Derived asset registered"
        );
        summary.succeeded += 1;
        summary.produced.push(id);
        Ok(())
    }

    async fn log_coverage(&self, target: AssetType) {
        match self.sink.store().dates(target.as_str()).await {
            Ok(dates) if dates.is_empty() => debug!(stream = %target, "Tabular stream is empty"),
            Ok(dates) => info!(
                stream = %target,
                days = dates.len(),
                first = %dates[0],
                last = %dates[dates.len() - 1],
                "Existing tabular coverage"
            ),
            Err(e) => warn!(stream = %target, "Cannot read tabular coverage: {}", e),
        }
    }

    fn log_summary(&self, summary: &SweepSummary) {
        info!(
            scope = %summary.scope,
            steps = summary.steps.len(),
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            cancelled = summary.cancelled,
            "Sweep finished"
        );
    }
}
