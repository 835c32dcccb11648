use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use catalog::{AssetRecord, parent_key};
use common::{AssetType, Scope, TimeBounds};

use crate::payload::DerivedPayload;

/// How candidates are presented to a transform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TransformMode {
    /// One call per unprocessed source asset.
    #[default]
    Single,
    /// One call over every unprocessed source asset in the scope.
    Batch,
}

/// Several source assets merged into one transform input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchAsset {
    pub scope: Scope,
    pub source_type: AssetType,
    pub members: Vec<AssetRecord>,
}

impl BatchAsset {
    pub fn new(scope: Scope, source_type: AssetType, mut members: Vec<AssetRecord>) -> Self {
        members.sort_by_key(|m| m.id);
        Self {
            scope,
            source_type,
            members,
        }
    }

    /// Bounds spanning every member that has bounds.
    pub fn time_bounds(&self) -> Option<TimeBounds> {
        self.members
            .iter()
            .filter_map(AssetRecord::time_bounds)
            .reduce(|a, b| a.widen(&b))
    }

    pub fn local_paths(&self) -> Vec<PathBuf> {
        self.members
            .iter()
            .filter_map(|m| m.local_path.clone())
            .collect()
    }
}

/// One unit of work within a step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Candidate {
    Single(AssetRecord),
    Batch(BatchAsset),
}

impl Candidate {
    pub fn ids(&self) -> Vec<i32> {
        match self {
            Self::Single(record) => vec![record.id],
            Self::Batch(batch) => batch.members.iter().map(|m| m.id).collect(),
        }
    }

    pub fn scope(&self) -> &Scope {
        match self {
            Self::Single(record) => &record.scope,
            Self::Batch(batch) => &batch.scope,
        }
    }

    pub fn source_type(&self) -> AssetType {
        match self {
            Self::Single(record) => record.asset_type,
            Self::Batch(batch) => batch.source_type,
        }
    }

    pub fn time_bounds(&self) -> Option<TimeBounds> {
        match self {
            Self::Single(record) => record.time_bounds(),
            Self::Batch(batch) => batch.time_bounds(),
        }
    }

    /// Short token used in output file names.
    pub fn label(&self) -> String {
        match self {
            Self::Single(record) => record.id.to_string(),
            Self::Batch(batch) => {
                let first = batch.members.first().map_or(0, |m| m.id);
                let last = batch.members.last().map_or(0, |m| m.id);
                format!("batch{first}-{last}")
            }
        }
    }

    pub fn as_single(&self) -> Option<&AssetRecord> {
        match self {
            Self::Single(record) => Some(record),
            Self::Batch(_) => None,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(record) => f.write_str(&record.describe()),
            Self::Batch(batch) => write!(
                f,
                "batch of {} {} assets in {} [{}]",
                batch.members.len(),
                batch.source_type,
                batch.scope,
                parent_key(&self.ids())
            ),
        }
    }
}

/// Working directories and auxiliary settings handed to every transform call.
#[derive(Clone, Debug)]
pub struct TransformContext {
    pub scope: Scope,
    pub target: AssetType,
    pub intermediate_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub settings: serde_json::Value,
}

/// A conversion from one asset type to another.
///
/// `apply` runs on a blocking worker thread and must not share mutable
/// state between calls.
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    fn mode(&self) -> TransformMode {
        TransformMode::Single
    }

    fn apply(&self, candidate: &Candidate, ctx: &TransformContext) -> Result<DerivedPayload>;
}

type TransformFn =
    Box<dyn Fn(&Candidate, &TransformContext) -> Result<DerivedPayload> + Send + Sync>;

/// A transform backed by a plain function or closure.
pub struct NativeTransform {
    name: String,
    mode: TransformMode,
    handler: TransformFn,
}

impl NativeTransform {
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Candidate, &TransformContext) -> Result<DerivedPayload> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            mode: TransformMode::Single,
            handler: Box::new(handler),
        }
    }

    /// Receive all unprocessed sources of a scope in one call.
    pub fn batch(mut self) -> Self {
        self.mode = TransformMode::Batch;
        self
    }

    pub fn shared(self) -> Arc<dyn Transform> {
        Arc::new(self)
    }
}

impl Transform for NativeTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> TransformMode {
        self.mode
    }

    fn apply(&self, candidate: &Candidate, ctx: &TransformContext) -> Result<DerivedPayload> {
        (self.handler)(candidate, ctx)
    }
}

impl fmt::Debug for NativeTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeTransform")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}
