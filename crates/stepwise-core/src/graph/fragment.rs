//! Fragment files and the `FragmentSource` port.
//!
//! A fragment is a YAML document:
//!
//! ```yaml
//! include:
//!   - shared/regions.yml
//! external:
//!   - data://garden/regions/2023-01-01/regions
//! steps:
//!   data://meadow/demo/2020-01-01/x:
//!     - snapshot://demo/2020-01-01/x.csv
//!   data://garden/demo/2020-01-01/x:
//!     - data://meadow/demo/2020-01-01/x
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use super::GraphError;

/// Raw, unvalidated contents of one fragment file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Fragment {
    /// Other fragments to merge, relative to this one.
    #[serde(default)]
    pub include: Vec<String>,
    /// Identifiers declared as external leaf sources.
    #[serde(default)]
    pub external: Vec<String>,
    /// Step identifier -> dependency identifiers (`null` means none).
    #[serde(default)]
    pub steps: BTreeMap<String, Option<Vec<String>>>,
}

impl Fragment {
    /// Parse a fragment document. An empty document is an empty fragment.
    pub fn parse(fragment: &str, content: &str) -> Result<Self, GraphError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_ng::from_str(content).map_err(|e| GraphError::FragmentParse {
            fragment: fragment.to_string(),
            detail: e.to_string(),
        })
    }
}

/// Where fragment documents come from.
///
/// Fragment names are opaque keys chosen by the source; the same file must
/// always resolve to the same key so diamond includes load it once and
/// include cycles are detected.
pub trait FragmentSource {
    /// Resolve an include entry written inside `from` to a fragment key.
    fn resolve(&self, from: &str, include: &str) -> Result<String, GraphError>;

    /// Resolve the root fragment reference to a key.
    fn resolve_root(&self, root: &str) -> Result<String, GraphError>;

    /// Read the document for a resolved key.
    fn read(&self, fragment: &str) -> Result<String, GraphError>;
}

/// Fragments held in memory, keyed by name. Includes are looked up verbatim.
#[derive(Debug, Clone, Default)]
pub struct MemoryFragmentSource {
    documents: HashMap<String, String>,
}

impl MemoryFragmentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.documents.insert(name.into(), content.into());
        self
    }
}

impl FragmentSource for MemoryFragmentSource {
    fn resolve(&self, _from: &str, include: &str) -> Result<String, GraphError> {
        Ok(include.to_string())
    }

    fn resolve_root(&self, root: &str) -> Result<String, GraphError> {
        Ok(root.to_string())
    }

    fn read(&self, fragment: &str) -> Result<String, GraphError> {
        self.documents
            .get(fragment)
            .cloned()
            .ok_or_else(|| GraphError::FragmentRead {
                fragment: fragment.to_string(),
                detail: "no such fragment".to_string(),
            })
    }
}
