//! The unified step dependency graph.
//!
//! - `fragment` -- fragment file format and the `FragmentSource` port
//! - `loader` -- include resolution and conflict-checked merge
//! - `select` -- sub-graph selection for a run
//!
//! A [`DependencyGraph`] is built once per run and is read-only afterwards;
//! every component receives it by reference (or behind an `Arc` when shared
//! with worker tasks).

pub mod fragment;
pub mod loader;
pub mod select;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use stepwise_types::identifier::{Category, MalformedIdentifierError, StepIdentifier};
use thiserror::Error;

pub use fragment::{Fragment, FragmentSource, MemoryFragmentSource};
pub use loader::load_graph;
pub use select::{ResolvedSelection, Selection, Selector};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while building or querying the graph. All of them are fatal
/// for a run: nothing executes when the graph cannot be built.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cannot read fragment {fragment}: {detail}")]
    FragmentRead { fragment: String, detail: String },

    #[error("cannot parse fragment {fragment}: {detail}")]
    FragmentParse { fragment: String, detail: String },

    #[error("in fragment {fragment}: {source}")]
    MalformedIdentifier {
        fragment: String,
        #[source]
        source: MalformedIdentifierError,
    },

    #[error("include cycle: {}", chain.join(" -> "))]
    IncludeCycle { chain: Vec<String> },

    #[error("step {step} is defined in both {first} and {second}")]
    DuplicateStep {
        step: StepIdentifier,
        first: String,
        second: String,
    },

    #[error("dependency cycle: {}", CyclePath(members))]
    DagCycle { members: Vec<StepIdentifier> },

    #[error("step {step} depends on unknown step {missing}")]
    UnknownDependency {
        step: StepIdentifier,
        missing: StepIdentifier,
    },

    #[error("no steps match '{0}'")]
    NoStepsMatched(String),
}

/// Renders `a -> b -> a` (each arrow reads "depends on").
struct CyclePath<'a>(&'a [StepIdentifier]);

impl fmt::Display for CyclePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in self.0 {
            write!(f, "{step} -> ")?;
        }
        match self.0.first() {
            Some(first) => write!(f, "{first}"),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Which adapter executes a node. Derived from the identifier's category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    Snapshot,
    Dataset,
    View,
    Export,
}

impl From<Category> for ExecutorKind {
    fn from(category: Category) -> Self {
        match category {
            Category::RawSnapshot => ExecutorKind::Snapshot,
            Category::CuratedDataset => ExecutorKind::Dataset,
            Category::PublishedView => ExecutorKind::View,
            Category::ExportedArtifact => ExecutorKind::Export,
        }
    }
}

/// One step of the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagNode {
    pub id: StepIdentifier,
    pub dependencies: BTreeSet<StepIdentifier>,
    pub kind: ExecutorKind,
    /// External leaf source: referenced but not defined by any fragment.
    pub external: bool,
    /// Fragment that defined the step (None for external leaves).
    pub origin: Option<String>,
}

impl DagNode {
    pub fn new(id: StepIdentifier, dependencies: BTreeSet<StepIdentifier>) -> Self {
        Self {
            kind: ExecutorKind::from(id.category()),
            id,
            dependencies,
            external: false,
            origin: None,
        }
    }

    pub fn external(id: StepIdentifier) -> Self {
        Self {
            external: true,
            ..Self::new(id, BTreeSet::new())
        }
    }

    /// External leaves other than snapshots are never built here; their
    /// artifact must already be in the store.
    pub fn is_stored_input(&self) -> bool {
        self.external && self.kind != ExecutorKind::Snapshot
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Validated, acyclic step graph with a reverse (dependents) index.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: BTreeMap<StepIdentifier, DagNode>,
    dependents: BTreeMap<StepIdentifier, BTreeSet<StepIdentifier>>,
    /// Topological order with identifier-sorted tie-breaking.
    order: Vec<StepIdentifier>,
}

impl DependencyGraph {
    /// Build and validate a graph from its nodes.
    ///
    /// Fails with `DagCycle` (reporting a shortest cycle) if the edges are not
    /// acyclic, then with `UnknownDependency` if any dependency is not a node.
    pub fn new(nodes: impl IntoIterator<Item = DagNode>) -> Result<Self, GraphError> {
        let nodes: BTreeMap<StepIdentifier, DagNode> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        let mut dependents: BTreeMap<StepIdentifier, BTreeSet<StepIdentifier>> =
            nodes.keys().map(|id| (id.clone(), BTreeSet::new())).collect();
        for node in nodes.values() {
            for dep in &node.dependencies {
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(node.id.clone());
                }
            }
        }

        // Kahn: repeatedly take the smallest node whose known dependencies are done.
        let mut remaining: BTreeMap<&StepIdentifier, usize> = nodes
            .values()
            .map(|n| {
                let known = n.dependencies.iter().filter(|d| nodes.contains_key(*d)).count();
                (&n.id, known)
            })
            .collect();
        let mut ready: BTreeSet<&StepIdentifier> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(id) = ready.pop_first() {
            remaining.remove(id);
            order.push(id.clone());
            for dependent in &dependents[id] {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() < nodes.len() {
            return Err(GraphError::DagCycle {
                members: shortest_cycle(&nodes),
            });
        }

        for node in nodes.values() {
            if let Some(missing) = node.dependencies.iter().find(|d| !nodes.contains_key(*d)) {
                return Err(GraphError::UnknownDependency {
                    step: node.id.clone(),
                    missing: missing.clone(),
                });
            }
        }

        Ok(Self {
            nodes,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &StepIdentifier) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &StepIdentifier) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    /// All nodes, identifier-sorted.
    pub fn nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.nodes.values()
    }

    pub fn dependencies(&self, id: &StepIdentifier) -> impl Iterator<Item = &StepIdentifier> {
        self.nodes.get(id).into_iter().flat_map(|n| n.dependencies.iter())
    }

    pub fn dependents(&self, id: &StepIdentifier) -> impl Iterator<Item = &StepIdentifier> {
        self.dependents.get(id).into_iter().flat_map(|d| d.iter())
    }

    /// Every node appears after all of its dependencies.
    pub fn topological_order(&self) -> &[StepIdentifier] {
        &self.order
    }

    /// Topological order restricted to `subset`.
    pub fn topological_order_of<'a>(
        &'a self,
        subset: &'a BTreeSet<StepIdentifier>,
    ) -> impl Iterator<Item = &'a StepIdentifier> + 'a {
        self.order.iter().filter(move |id| subset.contains(*id))
    }

    /// Transitive dependencies of `id` (excluding `id`).
    pub fn ancestors(&self, id: &StepIdentifier) -> BTreeSet<StepIdentifier> {
        self.walk(id, |g, n| g.dependencies(n).cloned().collect())
    }

    /// Transitive dependents of `id` (excluding `id`).
    pub fn descendants(&self, id: &StepIdentifier) -> BTreeSet<StepIdentifier> {
        self.walk(id, |g, n| g.dependents(n).cloned().collect())
    }

    fn walk(
        &self,
        start: &StepIdentifier,
        next: impl Fn(&Self, &StepIdentifier) -> Vec<StepIdentifier>,
    ) -> BTreeSet<StepIdentifier> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![start.clone()];
        while let Some(current) = stack.pop() {
            for n in next(self, &current) {
                if visited.insert(n.clone()) {
                    stack.push(n);
                }
            }
        }
        visited
    }

    /// Group `subset` into waves: wave `k` holds the nodes whose longest chain
    /// of dependencies inside the subset has length `k`.
    pub fn execution_waves(&self, subset: &BTreeSet<StepIdentifier>) -> Vec<Vec<StepIdentifier>> {
        let mut depths: HashMap<&StepIdentifier, usize> = HashMap::new();
        let mut waves: Vec<Vec<StepIdentifier>> = Vec::new();
        for id in self.topological_order_of(subset) {
            let depth = self
                .dependencies(id)
                .filter_map(|dep| depths.get(dep).map(|d| d + 1))
                .max()
                .unwrap_or(0);
            depths.insert(id, depth);
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(id.clone());
        }
        for wave in &mut waves {
            wave.sort();
        }
        waves
    }
}

/// Find a shortest dependency cycle, starting from the smallest identifier of
/// the first cyclic strongly connected component.
fn shortest_cycle(nodes: &BTreeMap<StepIdentifier, DagNode>) -> Vec<StepIdentifier> {
    let mut graph = DiGraph::<&StepIdentifier, ()>::new();
    let indices: HashMap<&StepIdentifier, NodeIndex> =
        nodes.keys().map(|id| (id, graph.add_node(id))).collect();
    for node in nodes.values() {
        for dep in &node.dependencies {
            if let Some(&dep_idx) = indices.get(dep) {
                graph.add_edge(indices[&node.id], dep_idx, ());
            }
        }
    }

    let component: BTreeSet<&StepIdentifier> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|scc| scc.into_iter().map(|idx| graph[idx]).collect::<BTreeSet<_>>())
        .min_by(|a, b| a.first().cmp(&b.first()))
        .unwrap_or_default();

    let Some(&start) = component.first() else {
        return Vec::new();
    };

    // BFS along dependency edges inside the component until we return to start.
    let mut parent: HashMap<&StepIdentifier, &StepIdentifier> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        for dep in &nodes[current].dependencies {
            if !component.contains(dep) {
                continue;
            }
            if dep == start {
                let mut path = vec![current.clone()];
                let mut cursor = current;
                while cursor != start {
                    cursor = parent[cursor];
                    path.push(cursor.clone());
                }
                path.reverse();
                return path;
            }
            if !parent.contains_key(dep) {
                parent.insert(dep, current);
                queue.push_back(dep);
            }
        }
    }
    component.into_iter().cloned().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
