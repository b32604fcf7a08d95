//! The top level of a build: configuration in, report out.

use std::fmt::Write as _;
use std::fs;
use std::num::NonZeroUsize;

use camino::{Utf8Path, Utf8PathBuf};

use crate::cache::FingerprintCache;
use crate::config::BuildConfig;
use crate::engine::{Executor, ExecutorOptions, Report};
use crate::error::ShikumiError;
use crate::graph::{Edge, TaskGraph};
use crate::plugin::PluginRegistry;

/// Command line overrides of a single run. `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub no_incremental: bool,
    pub fail_fast: Option<bool>,
    pub parallelism: Option<NonZeroUsize>,
    /// Where to write a JSON report of the run.
    pub report: Option<Utf8PathBuf>,
}

pub struct Orchestrator {
    registry: PluginRegistry,
    config: BuildConfig,
}

impl Orchestrator {
    pub fn new(registry: PluginRegistry, config: BuildConfig) -> Self {
        Self { registry, config }
    }

    /// Load the configuration at `path` and use the built-in plugins.
    pub fn from_path(path: impl AsRef<Utf8Path>) -> Result<Self, ShikumiError> {
        let config = BuildConfig::load(path)?;
        Ok(Self::new(PluginRegistry::with_builtins(), config))
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Assemble and validate the task graph from the configured plugins.
    pub fn graph(&self) -> Result<TaskGraph, ShikumiError> {
        Ok(self.registry.apply(&self.config)?)
    }

    /// Build the graph, run the requested tasks, and persist fingerprints.
    ///
    /// Assembly errors abort before anything runs. Task failures don't make
    /// this return an error; they show up in the [`Report`].
    pub fn run<S: AsRef<str>>(&self, requested: &[S], options: &RunOptions) -> Result<Report, ShikumiError> {
        let graph = self.graph()?;
        graph.closure(requested)?;

        let cache = FingerprintCache::load(self.config.incremental_cache.clone());

        let executor = Executor::new(ExecutorOptions {
            fail_fast: options.fail_fast.unwrap_or(self.config.fail_fast),
            parallelism: options.parallelism.unwrap_or(self.config.parallelism),
            incremental: !options.no_incremental,
            root: self.config.root.clone(),
        });

        tracing::info!(
            tasks = graph.len(),
            parallelism = executor.options().parallelism.get(),
            fail_fast = executor.options().fail_fast,
            incremental = executor.options().incremental,
            "starting build"
        );

        let mut report = executor.run(&graph, &cache, requested)?;

        if let Err(err) = cache.flush() {
            tracing::warn!("couldn't persist fingerprints: {err}");
            report.warnings.push(format!("fingerprints were not saved: {err}"));
        }

        if let Some(path) = &options.report {
            if let Err(err) = write_report(&report, path) {
                tracing::warn!("{err}");
                report.warnings.push(err.to_string());
            }
        }

        tracing::info!(
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "build finished in {:.2?}",
            report.duration
        );

        Ok(report)
    }

    /// Human readable listing of every task, in registration order.
    pub fn describe_tasks(&self) -> Result<String, ShikumiError> {
        let graph = self.graph()?;
        let mut out = String::new();

        for task in graph.tasks() {
            let _ = write!(out, "{}", task.name());
            if let Some(description) = task.description() {
                let _ = write!(out, " - {description}");
            }
            if !task.is_enabled() {
                let _ = write!(out, " (disabled)");
            }
            let _ = writeln!(out);

            let dependencies = graph.prerequisites_of(task.name(), Edge::Dependency)?;
            if !dependencies.is_empty() {
                let _ = writeln!(out, "    depends on: {}", dependencies.join(", "));
            }
            let earlier = graph.prerequisites_of(task.name(), Edge::Ordering)?;
            if !earlier.is_empty() {
                let _ = writeln!(out, "    runs after: {}", earlier.join(", "));
            }
        }

        Ok(out)
    }
}

fn write_report(report: &Report, path: &Utf8Path) -> Result<(), ShikumiError> {
    let json = report
        .to_json()
        .map_err(|e| ShikumiError::Report(path.to_owned(), e.into()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| ShikumiError::Report(path.to_owned(), e))?;
    }

    fs::write(path, json).map_err(|e| ShikumiError::Report(path.to_owned(), e))
}
