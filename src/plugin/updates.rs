//! Reports dependencies that have newer stable versions available.
//!
//! Candidates are filtered through a [`VersionFilter`], which rejects
//! pre-release versions by qualifier: `1.0-rc1`, `2.3.0.Beta2` or `5.0-M3` are
//! rejected, `1.0` and `31.1-jre` are not.

use std::cmp::Ordering;

use anyhow::bail;
use regex::Regex;
use serde::Deserialize;

use crate::plugin::{Plugin, PluginContext};
use crate::task::{Input, Task, TaskContext};

pub const DEFAULT_QUALIFIERS: &[&str] = &["alpha", "beta", "rc", "cr", "m", "preview", "b", "ea"];

fn default_qualifiers() -> Vec<String> {
    DEFAULT_QUALIFIERS.iter().map(|q| q.to_string()).collect()
}

/// One declared dependency and the versions it could move to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencySpec {
    pub name: String,
    pub current: String,
    #[serde(default)]
    pub available: Vec<String>,
}

/// The `[plugins.dependencyUpdates]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdatesSection {
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default = "default_qualifiers")]
    pub reject_qualifiers: Vec<String>,
    /// Fail the task when any dependency has an outstanding upgrade.
    #[serde(default)]
    pub fail_on_updates: bool,
}

/// Decides which candidate versions count as stable releases.
#[derive(Debug, Clone)]
pub struct VersionFilter {
    rejected: Vec<Regex>,
}

impl VersionFilter {
    pub fn new<S: AsRef<str>>(qualifiers: &[S]) -> Result<Self, regex::Error> {
        let rejected = qualifiers
            .iter()
            .map(|q| {
                let q = regex::escape(q.as_ref());
                Regex::new(&format!(r"^(?i:.*[.-]{q}[.\d+-]*)$"))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { rejected })
    }

    pub fn is_stable(&self, version: &str) -> bool {
        !self.rejected.iter().any(|re| re.is_match(version))
    }

    /// The newest stable candidate that is newer than `current`.
    pub fn newest_upgrade<'a>(&self, dependency: &'a DependencySpec) -> Option<&'a str> {
        dependency
            .available
            .iter()
            .map(String::as_str)
            .filter(|candidate| self.is_stable(candidate))
            .filter(|candidate| compare_versions(candidate, &dependency.current) == Ordering::Greater)
            .max_by(|a, b| compare_versions(a, b))
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Part<'a> {
    // Variant order matters: any qualifier sorts before any number.
    Text(&'a str),
    Number(u64),
}

fn parts(version: &str) -> impl Iterator<Item = Part<'_>> {
    version
        .split(['.', '-', '+', '_'])
        .filter(|part| !part.is_empty())
        .map(|part| match part.parse() {
            Ok(number) => Part::Number(number),
            Err(_) => Part::Text(part),
        })
}

/// Compare dotted versions component-wise. Numeric components compare
/// numerically, and a version with extra components is the newer one.
pub(crate) fn compare_versions(a: &str, b: &str) -> Ordering {
    parts(a).cmp(parts(b))
}

struct UpdatesAction {
    dependencies: Vec<DependencySpec>,
    filter: VersionFilter,
    fail_on_updates: bool,
}

impl crate::task::Action for UpdatesAction {
    fn execute(&self, context: &mut TaskContext<'_>) -> anyhow::Result<()> {
        let mut outdated = 0;

        for dependency in &self.dependencies {
            if let Some(newest) = self.filter.newest_upgrade(dependency) {
                outdated += 1;
                context.emit(format!("{}: {} -> {newest}", dependency.name, dependency.current));
            }
        }

        if outdated == 0 {
            context.emit("all dependencies are using the latest stable versions");
            return Ok(());
        }

        tracing::info!(task = context.name(), "{outdated} dependencies have newer stable versions");

        if self.fail_on_updates {
            bail!("{outdated} dependencies have newer stable versions");
        }

        Ok(())
    }
}

fn contribute(ctx: &mut PluginContext<'_>) -> anyhow::Result<()> {
    let section: UpdatesSection = ctx.section()?;
    let filter = VersionFilter::new(&section.reject_qualifiers)?;

    let declared = section.dependencies.iter().map(|dep| {
        Input::Value(format!("{}:{}:{}", dep.name, dep.current, dep.available.join(",")))
    });

    let task = Task::with_action(
        "dependencyUpdates",
        UpdatesAction {
            dependencies: section.dependencies.clone(),
            filter,
            fail_on_updates: section.fail_on_updates,
        },
    )
    .describe("Reports dependencies with newer stable versions")
    .input(Input::Value(format!(
        "reject={} failOnUpdates={}",
        section.reject_qualifiers.join(","),
        section.fail_on_updates
    )))
    .inputs(declared.collect::<Vec<_>>());

    ctx.add_task(task);
    Ok(())
}

pub(crate) const PLUGIN: Plugin = Plugin::new(contribute);
