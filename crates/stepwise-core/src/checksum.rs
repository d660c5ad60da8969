//! Fingerprint computation.
//!
//! A node's fingerprint covers its own definition and, through the
//! fingerprints of its dependencies, the definitions of everything upstream:
//!
//! ```text
//! fp(n) = sha256( frame(SALT)
//!              ++ frame(render(n))
//!              ++ definition(n)
//!              ++ count(deps)
//!              ++ for d in sorted(deps): frame(render(d)) ++ fp(d) )
//! ```
//!
//! Every variable-length field is length-prefixed so distinct inputs never
//! concatenate to the same byte string. The engine only computes values; it
//! makes no cache decisions.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::StepIdentifier;
use thiserror::Error;

use crate::graph::{DagNode, DependencyGraph};

/// Format salt. Changing it invalidates every stored artifact.
const SALT: &[u8] = b"stepwise-fingerprint-v1";

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("step {0} has no definition")]
    MissingDefinition(StepIdentifier),

    #[error("cannot read definition of {step}: {detail}")]
    Read { step: StepIdentifier, detail: String },

    #[error("step {0} is not in the graph")]
    UnknownStep(StepIdentifier),
}

/// Supplies the canonical definition bytes of a node.
///
/// For transformation steps this is the step's code; for raw snapshots it is
/// the recorded content checksum of the snapshot. `Ok(None)` means nothing is
/// defined for the node.
pub trait DefinitionSource: Send + Sync {
    fn definition(
        &self,
        node: &DagNode,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, ChecksumError>> + Send;
}

/// Fingerprints of the nodes covered by one computation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintTable {
    entries: BTreeMap<StepIdentifier, Fingerprint>,
}

impl FingerprintTable {
    pub fn get(&self, id: &StepIdentifier) -> Option<Fingerprint> {
        self.entries.get(id).copied()
    }

    pub fn contains(&self, id: &StepIdentifier) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StepIdentifier, &Fingerprint)> {
        self.entries.iter()
    }
}

/// Computes fingerprints in dependency order.
#[derive(Debug, Clone)]
pub struct ChecksumEngine {
    /// Maximum number of definitions read at once.
    concurrency: usize,
}

impl Default for ChecksumEngine {
    fn default() -> Self {
        Self::new(8)
    }
}

impl ChecksumEngine {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Fingerprint every node of `subset` and all of their ancestors.
    pub async fn compute<D: DefinitionSource>(
        &self,
        graph: &DependencyGraph,
        source: &D,
        subset: &BTreeSet<StepIdentifier>,
    ) -> Result<FingerprintTable, ChecksumError> {
        let mut closure = BTreeSet::new();
        for id in subset {
            if !graph.contains(id) {
                return Err(ChecksumError::UnknownStep(id.clone()));
            }
            closure.insert(id.clone());
            closure.extend(graph.ancestors(id));
        }

        let nodes: Vec<&DagNode> = closure.iter().filter_map(|id| graph.node(id)).collect();
        let reads: Vec<(StepIdentifier, Result<Option<Vec<u8>>, ChecksumError>)> =
            futures_util::stream::iter(nodes)
                .map(|node| async move { (node.id.clone(), source.definition(node).await) })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

        let mut definitions: BTreeMap<StepIdentifier, Option<Vec<u8>>> = BTreeMap::new();
        for (id, read) in reads {
            definitions.insert(id, read?);
        }

        let mut entries: BTreeMap<StepIdentifier, Fingerprint> = BTreeMap::new();
        for id in graph.topological_order_of(&closure) {
            let Some(node) = graph.node(id) else {
                return Err(ChecksumError::UnknownStep(id.clone()));
            };
            let definition = definitions.get(id).and_then(|d| d.as_deref());
            if definition.is_none() && !node.external {
                return Err(ChecksumError::MissingDefinition(id.clone()));
            }

            let mut upstream = Vec::with_capacity(node.dependencies.len());
            for dep in &node.dependencies {
                let fp = entries
                    .get(dep)
                    .copied()
                    .ok_or_else(|| ChecksumError::UnknownStep(dep.clone()))?;
                upstream.push((dep, fp));
            }

            let fp = combine(id, definition, &upstream);
            tracing::trace!(step = %id, fingerprint = %fp.short(), "fingerprint computed");
            entries.insert(id.clone(), fp);
        }

        tracing::debug!(nodes = entries.len(), "fingerprints computed");
        Ok(FingerprintTable { entries })
    }
}

/// Fingerprint of one node from its definition and its dependencies'
/// fingerprints. `upstream` must be identifier-sorted.
pub fn combine(
    id: &StepIdentifier,
    definition: Option<&[u8]>,
    upstream: &[(&StepIdentifier, Fingerprint)],
) -> Fingerprint {
    let mut hasher = Sha256::new();
    frame(&mut hasher, SALT);
    frame(&mut hasher, id.to_string().as_bytes());
    match definition {
        Some(bytes) => {
            hasher.update([1u8]);
            frame(&mut hasher, bytes);
        }
        None => hasher.update([0u8]),
    }
    hasher.update((upstream.len() as u64).to_le_bytes());
    for (dep, fp) in upstream {
        frame(&mut hasher, dep.to_string().as_bytes());
        hasher.update(fp.as_bytes());
    }
    Fingerprint::from_bytes(hasher.finalize().into())
}

fn frame(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryDefinitionSource, id};

    const A: &str = "data://garden/demo/2020-01-01/a";
    const B: &str = "data://garden/demo/2020-01-01/b";
    const C: &str = "data://garden/demo/2020-01-01/c";
    const D: &str = "data://garden/demo/2020-01-01/d";

    fn graph() -> DependencyGraph {
        DependencyGraph::new(vec![
            DagNode::new(id(A), BTreeSet::new()),
            DagNode::new(id(B), BTreeSet::from([id(A)])),
            DagNode::new(id(C), BTreeSet::from([id(B)])),
            DagNode::new(id(D), BTreeSet::new()),
        ])
        .unwrap()
    }

    fn all(graph: &DependencyGraph) -> BTreeSet<StepIdentifier> {
        graph.nodes().map(|n| n.id.clone()).collect()
    }

    fn source(a_code: &str) -> MemoryDefinitionSource {
        MemoryDefinitionSource::new()
            .with(A, a_code)
            .with(B, "b code")
            .with(C, "c code")
            .with(D, "d code")
    }

    #[tokio::test]
    async fn compute_is_deterministic() {
        let graph = graph();
        let engine = ChecksumEngine::new(2);
        let first = engine.compute(&graph, &source("a"), &all(&graph)).await.unwrap();
        let second = engine.compute(&graph, &source("a"), &all(&graph)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    #[tokio::test]
    async fn changing_a_leaf_changes_exactly_its_dependents() {
        let graph = graph();
        let engine = ChecksumEngine::default();
        let before = engine.compute(&graph, &source("a v1"), &all(&graph)).await.unwrap();
        let after = engine.compute(&graph, &source("a v2"), &all(&graph)).await.unwrap();

        for changed in [A, B, C] {
            assert_ne!(before.get(&id(changed)), after.get(&id(changed)), "{changed}");
        }
        assert_eq!(before.get(&id(D)), after.get(&id(D)));
    }

    #[tokio::test]
    async fn subset_covers_ancestors_only() {
        let graph = graph();
        let table = ChecksumEngine::default()
            .compute(&graph, &source("a"), &BTreeSet::from([id(B)]))
            .await
            .unwrap();
        assert!(table.contains(&id(A)));
        assert!(table.contains(&id(B)));
        assert!(!table.contains(&id(C)));
        assert!(!table.contains(&id(D)));
    }

    #[tokio::test]
    async fn missing_definition_is_an_error() {
        let graph = graph();
        let source = MemoryDefinitionSource::new().with(A, "a").with(B, "b");
        let err = ChecksumEngine::default()
            .compute(&graph, &source, &BTreeSet::from([id(C)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChecksumError::MissingDefinition(ref s) if s == &id(C)));
    }

    #[tokio::test]
    async fn external_leaf_without_definition_uses_identifier() {
        let snap = "snapshot://demo/2020-01-01/x.csv";
        let graph = DependencyGraph::new(vec![
            DagNode::external(id(snap)),
            DagNode::new(id(A), BTreeSet::from([id(snap)])),
        ])
        .unwrap();
        let table = ChecksumEngine::default()
            .compute(&graph, &MemoryDefinitionSource::new().with(A, "a"), &BTreeSet::from([id(A)]))
            .await
            .unwrap();
        assert_eq!(table.get(&id(snap)), Some(combine(&id(snap), None, &[])));
    }

    #[tokio::test]
    async fn unknown_step_is_rejected() {
        let graph = graph();
        let err = ChecksumEngine::default()
            .compute(&graph, &source("a"), &BTreeSet::from([id("data://garden/x/2020-01-01/zz")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChecksumError::UnknownStep(_)));
    }

    #[test]
    fn framing_separates_identifier_and_definition() {
        let a = id(A);
        let empty = combine(&a, Some(b""), &[]);
        let absent = combine(&a, None, &[]);
        assert_ne!(empty, absent);
        assert_ne!(combine(&a, Some(b"xy"), &[]), combine(&a, Some(b"x"), &[]));
    }

    #[test]
    fn dependency_fingerprint_feeds_into_dependent() {
        let (a, b) = (id(A), id(B));
        let fp1 = Fingerprint::from_bytes([1; 32]);
        let fp2 = Fingerprint::from_bytes([2; 32]);
        assert_ne!(
            combine(&b, Some(b"b"), &[(&a, fp1)]),
            combine(&b, Some(b"b"), &[(&a, fp2)])
        );
    }
}
