use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::ArcStr;

/// Errors raised while assembling or validating a [`TaskGraph`](crate::TaskGraph).
///
/// All of them are fatal: a graph that fails any of these checks is never
/// handed to the executor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{0}' is already registered")]
    DuplicateTask(ArcStr),

    #[error("Task '{0}' is not registered")]
    UnknownTask(ArcStr),

    #[error("Cycle detected in task graph: {}", format_cycle(.0))]
    CycleDetected(Vec<ArcStr>),
}

fn format_cycle(members: &[ArcStr]) -> String {
    let mut out = members.join(" -> ");
    if let Some(first) = members.first() {
        out.push_str(" -> ");
        out.push_str(first);
    }
    out
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error("Plugin '{key}' failed to contribute tasks:\n{source}")]
    Contribution {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Failure reported by a task action at run time.
///
/// The inner error is shared so that [`ExecutionResult`](crate::ExecutionResult)
/// can stay `Clone`.
#[derive(Debug, Error, Clone)]
#[error("{0:#}")]
pub struct TaskExecutionError(pub(crate) Arc<anyhow::Error>);

impl TaskExecutionError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for TaskExecutionError {
    fn from(e: anyhow::Error) -> Self {
        TaskExecutionError(Arc::new(e))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Couldn't access fingerprint cache '{0}'.\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Fingerprint cache '{0}' is corrupted.\n{1}")]
    Corrupted(Utf8PathBuf, String),

    #[error("Fingerprint cache '{path}' has unsupported version {found}")]
    Version { path: Utf8PathBuf, found: u32 },

    #[error("Couldn't serialize fingerprint cache.\n{0}")]
    Serialize(#[from] ciborium::ser::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration file '{0}'.\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse configuration file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, toml::de::Error),

    #[error("Invalid configuration for plugin '{0}'.\n{1}")]
    Plugin(String, toml::de::Error),

    #[error("Configuration path '{0}' is not valid UTF-8")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("'parallelism' must be at least 1")]
    Parallelism,
}

#[derive(Debug, Error)]
pub enum ShikumiError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Couldn't write report '{0}'.\n{1}")]
    Report(Utf8PathBuf, std::io::Error),
}
