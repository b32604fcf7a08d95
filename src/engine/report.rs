use std::fmt::{Display, Formatter};
use std::time::Duration;

use console::style;
use serde::Serialize;

use crate::core::ArcStr;
use crate::error::TaskExecutionError;

/// Coarse status of a finished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Inputs and outputs match the last successful run.
    UpToDate,
    /// The task is disabled in the configuration.
    Disabled,
    /// Not dispatched because the run was cancelled after a failure.
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum Failure {
    /// The action itself returned an error or panicked.
    Action(TaskExecutionError),
    /// A dependency failed, so the action never ran. Holds the name of the
    /// direct dependency through which the failure arrived.
    Dependency(ArcStr),
}

/// Detailed outcome of a task.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeeded,
    Skipped(SkipReason),
    Failed(Failure),
}

impl Outcome {
    pub fn status(&self) -> Status {
        match self {
            Outcome::Succeeded => Status::Succeeded,
            Outcome::Skipped(_) => Status::Skipped,
            Outcome::Failed(_) => Status::Failed,
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Succeeded => write!(f, "succeeded"),
            Outcome::Skipped(SkipReason::UpToDate) => write!(f, "up-to-date"),
            Outcome::Skipped(SkipReason::Disabled) => write!(f, "disabled"),
            Outcome::Skipped(SkipReason::Cancelled) => write!(f, "cancelled"),
            Outcome::Failed(Failure::Action(err)) => write!(f, "failed: {err}"),
            Outcome::Failed(Failure::Dependency(name)) => {
                write!(f, "failed: dependency '{name}' failed")
            }
        }
    }
}

/// The result of one task in one run. Immutable once produced.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub name: ArcStr,
    pub outcome: Outcome,
    pub duration: Duration,
    /// Diagnostic output captured from the action.
    pub output: String,
}

impl ExecutionResult {
    pub fn new(name: ArcStr, outcome: Outcome, duration: Duration, output: String) -> Self {
        Self {
            name,
            outcome,
            duration,
            output,
        }
    }

    pub fn status(&self) -> Status {
        self.outcome.status()
    }

    pub fn is_failed(&self) -> bool {
        self.status() == Status::Failed
    }
}

/// Serializable view of a result, used for JSON reports.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultView<'a> {
    name: &'a str,
    status: Status,
    detail: String,
    duration_ms: u64,
    output: &'a str,
}

/// All results of a run, in topological order.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub results: Vec<ExecutionResult>,
    pub duration: Duration,
    /// Non-fatal problems encountered during the run, e.g. a corrupted cache.
    pub warnings: Vec<String>,
}

impl Report {
    pub fn get(&self, name: &str) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| &*r.name == name)
    }

    pub fn count(&self, status: Status) -> usize {
        self.results.iter().filter(|r| r.status() == status).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(Status::Succeeded)
    }

    pub fn skipped(&self) -> usize {
        self.count(Status::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(Status::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// Process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    /// Names of tasks whose actions actually ran, in reporting order.
    pub fn executed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Succeeded | Outcome::Failed(Failure::Action(_))))
            .map(|r| &*r.name)
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let views: Vec<_> = self
            .results
            .iter()
            .map(|r| ResultView {
                name: &r.name,
                status: r.status(),
                detail: r.outcome.to_string(),
                duration_ms: r.duration.as_millis() as u64,
                output: &r.output,
            })
            .collect();

        serde_json::to_string_pretty(&serde_json::json!({
            "succeeded": self.succeeded(),
            "skipped": self.skipped(),
            "failed": self.failed(),
            "durationMs": self.duration.as_millis() as u64,
            "warnings": self.warnings,
            "results": views,
        }))
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for result in &self.results {
            let marker = match result.status() {
                Status::Succeeded => style("✓").green(),
                Status::Skipped => style("-").blue(),
                Status::Failed => style("✗").red(),
            };
            writeln!(
                f,
                "{marker} {} {} {}",
                style(&result.name).bold(),
                result.outcome,
                style(format!("({:.2?})", result.duration)).dim()
            )?;

            if result.is_failed() && !result.output.is_empty() {
                for line in result.output.lines() {
                    writeln!(f, "    {line}")?;
                }
            }
        }

        for warning in &self.warnings {
            writeln!(f, "{} {warning}", style("warning:").yellow())?;
        }

        let summary = format!(
            "{} succeeded, {} skipped, {} failed",
            self.succeeded(),
            self.skipped(),
            self.failed()
        );
        let summary = if self.is_success() {
            style(summary).green()
        } else {
            style(summary).red()
        };
        write!(f, "{summary} in {:.2?}", self.duration)
    }
}
