//! Fragment loading: include resolution, merge, and graph construction.
//!
//! The algorithm:
//!
//! 1. Walk includes depth-first from the root, keeping the current include
//!    chain to detect include cycles. A fragment reached twice through
//!    different paths (a diamond) is read once.
//! 2. Merge every fragment's steps into one mapping, visiting fragments in
//!    key order so the outcome never depends on include order. A step defined
//!    in two fragments is a `DuplicateStep` error.
//! 3. Add external leaves: raw-snapshot dependencies that no fragment defines,
//!    and identifiers listed under `external:`.
//! 4. Hand the nodes to `DependencyGraph::new`, which rejects cycles and then
//!    dangling dependencies.

use std::collections::{BTreeMap, BTreeSet};

use stepwise_types::identifier::{Category, StepIdentifier};

use super::fragment::{Fragment, FragmentSource};
use super::{DagNode, DependencyGraph, GraphError};

/// Load and validate the graph rooted at `root`.
pub fn load_graph<F: FragmentSource + ?Sized>(
    source: &F,
    root: &str,
) -> Result<DependencyGraph, GraphError> {
    let root_key = source.resolve_root(root)?;
    let mut fragments = BTreeMap::new();
    collect(source, &root_key, &mut Vec::new(), &mut fragments)?;

    let nodes = merge(&fragments)?;
    let graph = DependencyGraph::new(nodes)?;

    tracing::debug!(
        root = root_key.as_str(),
        fragments = fragments.len(),
        steps = graph.len(),
        "loaded dependency graph"
    );
    Ok(graph)
}

fn collect<F: FragmentSource + ?Sized>(
    source: &F,
    key: &str,
    chain: &mut Vec<String>,
    loaded: &mut BTreeMap<String, Fragment>,
) -> Result<(), GraphError> {
    if let Some(pos) = chain.iter().position(|k| k == key) {
        let mut cycle = chain[pos..].to_vec();
        // Report the cycle starting from its smallest member.
        if let Some(min) = (0..cycle.len()).min_by(|&a, &b| cycle[a].cmp(&cycle[b])) {
            cycle.rotate_left(min);
        }
        cycle.push(cycle[0].clone());
        return Err(GraphError::IncludeCycle { chain: cycle });
    }
    if loaded.contains_key(key) {
        return Ok(());
    }

    let content = source.read(key)?;
    let fragment = Fragment::parse(key, &content)?;

    chain.push(key.to_string());
    for include in &fragment.include {
        let child = source.resolve(key, include)?;
        collect(source, &child, chain, loaded)?;
    }
    chain.pop();

    loaded.insert(key.to_string(), fragment);
    Ok(())
}

fn parse_id(fragment: &str, raw: &str) -> Result<StepIdentifier, GraphError> {
    StepIdentifier::parse(raw).map_err(|source| GraphError::MalformedIdentifier {
        fragment: fragment.to_string(),
        source,
    })
}

fn merge(fragments: &BTreeMap<String, Fragment>) -> Result<Vec<DagNode>, GraphError> {
    let mut defined: BTreeMap<StepIdentifier, (&str, BTreeSet<StepIdentifier>)> = BTreeMap::new();
    let mut duplicates: BTreeMap<StepIdentifier, (String, String)> = BTreeMap::new();
    let mut declared_external: BTreeSet<StepIdentifier> = BTreeSet::new();

    for (key, fragment) in fragments {
        for (raw, deps) in &fragment.steps {
            let step = parse_id(key, raw)?;
            let deps = deps
                .iter()
                .flatten()
                .map(|d| parse_id(key, d))
                .collect::<Result<BTreeSet<_>, _>>()?;

            if let Some((first, _)) = defined.get(&step) {
                duplicates
                    .entry(step)
                    .or_insert_with(|| (first.to_string(), key.clone()));
                continue;
            }
            defined.insert(step, (key.as_str(), deps));
        }
        for raw in &fragment.external {
            declared_external.insert(parse_id(key, raw)?);
        }
    }

    if let Some((step, (first, second))) = duplicates.into_iter().next() {
        return Err(GraphError::DuplicateStep {
            step,
            first,
            second,
        });
    }

    let mut external: BTreeSet<StepIdentifier> = declared_external
        .into_iter()
        .filter(|id| !defined.contains_key(id))
        .collect();
    for (_, deps) in defined.values() {
        for dep in deps {
            if !defined.contains_key(dep) && dep.category() == Category::RawSnapshot {
                external.insert(dep.clone());
            }
        }
    }

    let mut nodes: Vec<DagNode> = defined
        .into_iter()
        .map(|(step, (origin, deps))| DagNode::new(step, deps).with_origin(origin))
        .collect();
    nodes.extend(external.into_iter().map(DagNode::external));
    Ok(nodes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
