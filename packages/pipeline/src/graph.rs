use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use common::AssetType;
use thiserror::Error;
use tracing::{debug, warn};

use crate::transform::Transform;

/// Conversions the field-site toolchain knows about. A graph built without a
/// handler for one of these logs a warning.
pub const STANDARD_LINKS: &[(AssetType, AssetType)] = &[
    (AssetType::QcPin, AssetType::ShotData),
    (AssetType::NovatelPin, AssetType::Rinex),
    (AssetType::Novatel, AssetType::Rinex),
    (AssetType::Novatel, AssetType::ImuPosition),
    (AssetType::Novatel770, AssetType::Rinex),
    (AssetType::Novatel770, AssetType::GnssObsTdb),
    (AssetType::Novatel000, AssetType::GnssObsTdb),
    (AssetType::Rinex, AssetType::Kin),
    (AssetType::Kin, AssetType::KinPosition),
    (AssetType::Kin, AssetType::KinResiduals),
    (AssetType::Sonardyne, AssetType::Acoustic),
    (AssetType::Dfop00, AssetType::ShotData),
    (AssetType::Master, AssetType::SiteConfig),
    (AssetType::LeverArm, AssetType::AtdOffset),
    (AssetType::Seabird, AssetType::Svp),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Transform {from} -> {to} registered twice")]
    DuplicateRegistration { from: AssetType, to: AssetType },

    #[error("Transform from {0} to itself")]
    SelfLoop(AssetType),

    #[error("Type graph has a cycle through {0:?}")]
    Cycle(Vec<AssetType>),
}

/// A `(source, target)` pair with the transform that performs it.
#[derive(Clone)]
pub struct Step {
    pub source: AssetType,
    pub target: AssetType,
    pub transform: Arc<dyn Transform>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("transform", &self.transform.name())
            .finish()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.source, self.target, self.transform.name())
    }
}

/// Collects registrations and validates them into a [`TypeGraph`].
#[derive(Default)]
pub struct GraphBuilder {
    steps: Vec<Step>,
}

impl GraphBuilder {
    pub fn register(
        mut self,
        source: AssetType,
        target: AssetType,
        transform: Arc<dyn Transform>,
    ) -> Self {
        self.steps.push(Step {
            source,
            target,
            transform,
        });
        self
    }

    pub fn build(self) -> Result<TypeGraph, GraphError> {
        TypeGraph::new(self.steps)
    }
}

/// Static `source -> {target -> transform}` map, validated once at startup.
///
/// Edge lists keep registration order, which is the tie-break order for
/// every traversal.
#[derive(Clone, Default)]
pub struct TypeGraph {
    forward: HashMap<AssetType, Vec<Step>>,
    reverse: HashMap<AssetType, Vec<AssetType>>,
    types: Vec<AssetType>,
}

impl TypeGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn new(steps: Vec<Step>) -> Result<Self, GraphError> {
        let mut graph = TypeGraph::default();
        let mut seen = HashSet::new();

        for step in steps {
            if step.source == step.target {
                return Err(GraphError::SelfLoop(step.source));
            }
            if !seen.insert((step.source, step.target)) {
                return Err(GraphError::DuplicateRegistration {
                    from: step.source,
                    to: step.target,
                });
            }
            for t in [step.source, step.target] {
                if !graph.types.contains(&t) {
                    graph.types.push(t);
                }
            }
            graph
                .reverse
                .entry(step.target)
                .or_default()
                .push(step.source);
            graph.forward.entry(step.source).or_default().push(step);
        }

        let order = graph.topological(&graph.types);
        if order.len() != graph.types.len() {
            let stuck = graph
                .types
                .iter()
                .copied()
                .filter(|t| !order.contains(t))
                .collect();
            return Err(GraphError::Cycle(stuck));
        }

        for (source, target) in STANDARD_LINKS {
            if graph.get(*source, *target).is_none() {
                warn!(%source, %target, "No transform registered for standard link");
            }
        }
        debug!(links = seen.len(), types = graph.types.len(), "Type graph built");

        Ok(graph)
    }

    pub fn get(&self, source: AssetType, target: AssetType) -> Option<&Step> {
        self.forward
            .get(&source)?
            .iter()
            .find(|s| s.target == target)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.forward.values().flatten()
    }

    /// Types that have a registered producer.
    pub fn producers(&self, target: AssetType) -> &[AssetType] {
        self.reverse.get(&target).map_or(&[], Vec::as_slice)
    }

    /// Types that can be produced directly from `source`, in registration order.
    pub fn targets(&self, source: AssetType) -> Vec<AssetType> {
        self.forward
            .get(&source)
            .map(|steps| steps.iter().map(|s| s.target).collect())
            .unwrap_or_default()
    }

    /// Derived types that must be produced, in dependency order, to reach
    /// `target` from raw inputs. Ends with `target` itself; empty when nothing
    /// produces `target`.
    pub fn ancestor_chain(&self, target: AssetType) -> Vec<AssetType> {
        let walked = self.walk(target, |t| self.producers(t).to_vec());
        let derived: Vec<_> = walked
            .into_iter()
            .filter(|t| !self.producers(*t).is_empty())
            .collect();
        self.topological(&derived)
    }

    /// Every type reachable forward from `source`, in breadth-first order.
    pub fn descendant_types(&self, source: AssetType) -> Vec<AssetType> {
        let mut walked = self.walk(source, |t| self.targets(t));
        walked.retain(|t| *t != source);
        walked
    }

    /// Steps needed to produce `target`, in execution order.
    pub fn steps_for(&self, target: AssetType) -> Vec<Step> {
        let chain = self.ancestor_chain(target);
        let mut out = Vec::new();
        for t in chain {
            for source in self.producers(t) {
                if let Some(step) = self.get(*source, t) {
                    out.push(step.clone());
                }
            }
        }
        out
    }

    /// Steps reachable from `source`, in execution order. Producers outside
    /// the reachable set are not included.
    pub fn steps_from(&self, source: AssetType) -> Vec<Step> {
        let mut reachable = vec![source];
        reachable.extend(self.descendant_types(source));
        let order = self.topological(&reachable);

        let mut out = Vec::new();
        for t in order.into_iter().filter(|t| *t != source) {
            for producer in self.producers(t) {
                if reachable.contains(producer) {
                    if let Some(step) = self.get(*producer, t) {
                        out.push(step.clone());
                    }
                }
            }
        }
        out
    }

    /// Breadth-first walk from `start`, returning types in first-seen order.
    fn walk<F>(&self, start: AssetType, next: F) -> Vec<AssetType>
    where
        F: Fn(AssetType) -> Vec<AssetType>,
    {
        let mut seen = vec![start];
        let mut queue = VecDeque::from([start]);
        while let Some(t) = queue.pop_front() {
            for n in next(t) {
                if !seen.contains(&n) {
                    seen.push(n);
                    queue.push_back(n);
                }
            }
        }
        seen
    }

    /// Kahn's algorithm over the subgraph induced by `subset`. Among ready
    /// types, the one earliest in `subset` goes first. Types on a cycle are
    /// left out.
    fn topological(&self, subset: &[AssetType]) -> Vec<AssetType> {
        let mut indegree: HashMap<AssetType, usize> = subset
            .iter()
            .map(|t| {
                let n = self
                    .producers(*t)
                    .iter()
                    .filter(|p| subset.contains(p))
                    .count();
                (*t, n)
            })
            .collect();

        let mut order = Vec::with_capacity(subset.len());
        loop {
            let Some(next) = subset
                .iter()
                .copied()
                .find(|t| indegree.get(t) == Some(&0) && !order.contains(t))
            else {
                break;
            };
            order.push(next);
            for target in self.targets(next) {
                if let Some(d) = indegree.get_mut(&target) {
                    *d = d.saturating_sub(1);
                }
            }
        }
        order
    }
}

impl fmt::Debug for TypeGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.steps()).finish()
    }
}
