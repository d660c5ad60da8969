//! Fragment files on the local filesystem.
//!
//! Fragment keys are canonical absolute paths, so the same file reached
//! through different relative includes is loaded once.

use std::path::{Path, PathBuf};

use stepwise_core::graph::{FragmentSource, GraphError};

/// Reads fragments from disk. Includes resolve relative to the including file.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFragmentSource;

impl FsFragmentSource {
    pub fn new() -> Self {
        Self
    }

    fn canonical(path: &Path) -> Result<String, GraphError> {
        std::fs::canonicalize(path)
            .map(|p| p.display().to_string())
            .map_err(|e| GraphError::FragmentRead {
                fragment: path.display().to_string(),
                detail: e.to_string(),
            })
    }
}

impl FragmentSource for FsFragmentSource {
    fn resolve(&self, from: &str, include: &str) -> Result<String, GraphError> {
        let base = Path::new(from).parent().map(Path::to_path_buf).unwrap_or_default();
        Self::canonical(&base.join(include))
    }

    fn resolve_root(&self, root: &str) -> Result<String, GraphError> {
        Self::canonical(&PathBuf::from(root))
    }

    fn read(&self, fragment: &str) -> Result<String, GraphError> {
        std::fs::read_to_string(fragment).map_err(|e| GraphError::FragmentRead {
            fragment: fragment.to_string(),
            detail: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::graph::load_graph;
    use stepwise_types::identifier::StepIdentifier;
    use tempfile::TempDir;

    fn id(s: &str) -> StepIdentifier {
        StepIdentifier::parse(s).unwrap()
    }

    #[test]
    fn loads_nested_includes_relative_to_the_including_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("dag/shared")).unwrap();
        std::fs::write(
            tmp.path().join("dag/main.yml"),
            r#"
include:
  - shared/regions.yml
steps:
  data://garden/demo/2020-01-01/population:
    - data://garden/regions/2023-01-01/regions
"#,
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("dag/shared/regions.yml"),
            r#"
include:
  - ../main.yml
steps:
  data://garden/regions/2023-01-01/regions:
"#,
        )
        .unwrap();

        // The include back to main.yml forms a cycle through canonical keys.
        let root = tmp.path().join("dag/main.yml").display().to_string();
        let err = load_graph(&FsFragmentSource::new(), &root).unwrap_err();
        assert!(matches!(err, GraphError::IncludeCycle { .. }));

        std::fs::write(
            tmp.path().join("dag/shared/regions.yml"),
            "steps:\n  data://garden/regions/2023-01-01/regions:\n",
        )
        .unwrap();
        let graph = load_graph(&FsFragmentSource::new(), &root).unwrap();
        assert_eq!(graph.len(), 2);
        assert!(graph.contains(&id("data://garden/regions/2023-01-01/regions")));
    }

    #[test]
    fn missing_root_is_a_read_error() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("nope.yml").display().to_string();
        let err = FsFragmentSource::new().resolve_root(&root).unwrap_err();
        assert!(matches!(err, GraphError::FragmentRead { ref fragment, .. } if fragment == &root));
    }

    #[test]
    fn equivalent_paths_share_a_key() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a")).unwrap();
        std::fs::write(tmp.path().join("a/x.yml"), "steps: {}").unwrap();
        let main = tmp.path().join("main.yml").display().to_string();
        let source = FsFragmentSource::new();
        let direct = source.resolve(&main, "a/x.yml").unwrap();
        let roundabout = source.resolve(&main, "a/../a/./x.yml").unwrap();
        assert_eq!(direct, roundabout);
    }
}
