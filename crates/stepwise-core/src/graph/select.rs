//! Choosing which part of the graph a run covers.

use std::collections::BTreeSet;

use stepwise_types::identifier::StepIdentifier;

use super::{DependencyGraph, GraphError};

/// One way of naming steps on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Exact(StepIdentifier),
    /// Substring of the rendered identifier.
    Pattern(String),
}

impl Selector {
    fn matches(&self, id: &StepIdentifier) -> bool {
        match self {
            Selector::All => true,
            Selector::Exact(exact) => exact == id,
            Selector::Pattern(pattern) => id.matches(pattern),
        }
    }

    fn describe(&self) -> String {
        match self {
            Selector::All => "all".to_string(),
            Selector::Exact(id) => id.to_string(),
            Selector::Pattern(pattern) => pattern.clone(),
        }
    }
}

/// Selectors plus the closure rules applied to what they match.
///
/// By default a run covers the matched steps and everything they depend on.
/// `downstream` also pulls in every transitive dependent of a match; `only`
/// drops the dependencies so just the targets execute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub selectors: Vec<Selector>,
    pub downstream: bool,
    pub only: bool,
}

/// Result of applying a [`Selection`] to a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSelection {
    /// Steps the user asked for (matches, plus dependents with `downstream`).
    pub targets: BTreeSet<StepIdentifier>,
    /// Every step the run covers: the targets and, unless `only`, their ancestors.
    pub nodes: BTreeSet<StepIdentifier>,
}

impl Selection {
    pub fn all() -> Self {
        Self {
            selectors: vec![Selector::All],
            ..Self::default()
        }
    }

    pub fn exact(id: StepIdentifier) -> Self {
        Self {
            selectors: vec![Selector::Exact(id)],
            ..Self::default()
        }
    }

    pub fn patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selectors: patterns
                .into_iter()
                .map(|p| Selector::Pattern(p.into()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn with_downstream(mut self, downstream: bool) -> Self {
        self.downstream = downstream;
        self
    }

    pub fn with_only(mut self, only: bool) -> Self {
        self.only = only;
        self
    }

    /// Resolve against `graph`. An empty selector list selects everything.
    ///
    /// Every selector must match at least one step, otherwise the run fails
    /// with `NoStepsMatched` naming the first selector that matched nothing.
    pub fn resolve(&self, graph: &DependencyGraph) -> Result<ResolvedSelection, GraphError> {
        let selectors: &[Selector] = if self.selectors.is_empty() {
            &[Selector::All]
        } else {
            &self.selectors
        };

        let mut targets = BTreeSet::new();
        for selector in selectors {
            let before = targets.len();
            let mut any = false;
            for node in graph.nodes() {
                if selector.matches(&node.id) {
                    any = true;
                    targets.insert(node.id.clone());
                }
            }
            if !any && !(matches!(selector, Selector::All) && graph.is_empty()) {
                return Err(GraphError::NoStepsMatched(selector.describe()));
            }
            tracing::trace!(
                selector = selector.describe().as_str(),
                matched = targets.len() - before,
                "selector resolved"
            );
        }

        if self.downstream {
            let dependents: Vec<_> = targets.iter().flat_map(|t| graph.descendants(t)).collect();
            targets.extend(dependents);
        }

        let mut nodes = targets.clone();
        if !self.only {
            for target in &targets {
                nodes.extend(graph.ancestors(target));
            }
        }

        Ok(ResolvedSelection { targets, nodes })
    }
}
