mod report;
mod runner;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use camino::Utf8PathBuf;

use crate::cache::FingerprintCache;
use crate::error::ShikumiError;
use crate::graph::TaskGraph;

pub use report::{ExecutionResult, Failure, Outcome, Report, SkipReason, Status};

/// Knobs of a single run.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// When a task fails, stop dispatching the tasks connected to it through
    /// dependency edges. Unrelated tasks keep running.
    pub fail_fast: bool,
    /// Number of worker threads.
    pub parallelism: NonZeroUsize,
    /// Skip tasks whose fingerprint matches the last successful run.
    pub incremental: bool,
    /// Directory that declared paths are relative to.
    pub root: Utf8PathBuf,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            fail_fast: true,
            parallelism: default_parallelism(),
            incremental: true,
            root: Utf8PathBuf::from("."),
        }
    }
}

pub fn default_parallelism() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

/// Executes a [`TaskGraph`] in dependency order on a pool of worker threads.
///
/// Each scheduled task runs at most once per call to [`Executor::run`].
/// When a task fails, everything that depends on it is reported as failed
/// without running. With `fail_fast` the tasks sharing a dependency chain
/// with the failure are also withheld; tasks already dispatched are allowed
/// to finish and unrelated tasks keep running.
pub struct Executor {
    options: ExecutorOptions,
    cancelled: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self {
            options,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Shared cancellation flag. Setting it stops the dispatch of new tasks.
    /// It is checked between tasks, never inside a running action.
    ///
    /// Setting it before [`Executor::run`] cancels every task of that run.
    /// The flag is cleared once the run returns.
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Run the requested tasks and everything they depend on.
    ///
    /// An empty request runs the whole graph. Results are reported in
    /// topological order regardless of the order in which tasks finished.
    pub fn run<S: AsRef<str>>(
        &self,
        graph: &TaskGraph,
        cache: &FingerprintCache,
        requested: &[S],
    ) -> Result<Report, ShikumiError> {
        let start = Instant::now();

        let order = graph.topological_order()?;
        let order = if requested.is_empty() {
            order
        } else {
            let selected = graph.closure(requested)?;
            order
                .into_iter()
                .filter(|index| selected.contains(index))
                .collect()
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.parallelism.get())
            .thread_name(|i| format!("shikumi-worker-{i}"))
            .build()?;

        let mut results = runner::run_tasks_parallel(
            &pool,
            graph,
            cache,
            &self.options,
            &self.cancelled,
            &order,
        );

        self.cancelled.store(false, Ordering::SeqCst);

        let results = order
            .iter()
            .filter_map(|index| results.remove(index))
            .collect();

        let mut warnings = Vec::new();
        if let Some(warning) = cache.warning() {
            warnings.push(format!("incremental cache disabled for this run: {warning}"));
        }

        Ok(Report {
            results,
            duration: start.elapsed(),
            warnings,
        })
    }
}

#[cfg(test)]
mod tests;
