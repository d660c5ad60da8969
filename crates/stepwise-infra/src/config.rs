//! Project configuration loader.
//!
//! Reads `stepwise.toml` and deserializes it into [`EngineConfig`]. Unlike a
//! long-running service, a build must not proceed on a half-read config: a
//! file that exists but does not parse is an error.

use std::path::{Path, PathBuf};

use stepwise_types::config::EngineConfig;
use thiserror::Error;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "stepwise.toml";

/// Environment variable overriding the `workers` setting.
pub const WORKERS_ENV: &str = "STEPWISE_WORKERS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {detail}", path.display())]
    Parse { path: PathBuf, detail: String },

    #[error("{WORKERS_ENV}={0} is not a positive integer")]
    InvalidWorkers(String),
}

/// Load the config at `path` and resolve its relative paths.
///
/// - Missing file: defaults when `explicit` is false, an error otherwise.
/// - Unparseable file: always an error.
/// - `STEPWISE_WORKERS` overrides the file's `workers`.
pub async fn load_engine_config(path: &Path, explicit: bool) -> Result<EngineConfig, ConfigError> {
    let path = absolute(path)?;
    let config = match tokio::fs::read_to_string(&path).await {
        Ok(content) => parse_config(&path, &content)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && !explicit => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            EngineConfig::default()
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let config = config.resolve_paths(&base);
    apply_workers_override(config, std::env::var(WORKERS_ENV).ok().as_deref())
}

fn parse_config(path: &Path, content: &str) -> Result<EngineConfig, ConfigError> {
    let config = toml::from_str::<EngineConfig>(content).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    if config.workers == Some(0) {
        return Err(ConfigError::Parse {
            path: path.to_path_buf(),
            detail: "workers must be at least 1".to_string(),
        });
    }
    Ok(config)
}

/// Apply the value of `STEPWISE_WORKERS`, if set.
pub fn apply_workers_override(
    mut config: EngineConfig,
    value: Option<&str>,
) -> Result<EngineConfig, ConfigError> {
    if let Some(raw) = value {
        let workers = raw
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ConfigError::InvalidWorkers(raw.to_string()))?;
        config.workers = Some(workers);
    }
    Ok(config)
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(cwd.join(path))
}
