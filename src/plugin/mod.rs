//! Plugins turn configuration sections into tasks.
//!
//! A [`Plugin`] is a plain function registered under a configuration key.
//! When the key is present in the build configuration, the function is handed
//! a [`PluginContext`] through which it reads its own section and contributes
//! tasks and edges. The [`PluginRegistry`] collects every contribution into a
//! single validated [`TaskGraph`].

mod command;
mod format;
mod tasks;
mod updates;

use serde::de::DeserializeOwned;

use crate::config::BuildConfig;
use crate::core::ArcStr;
use crate::error::PluginError;
use crate::graph::TaskGraph;
use crate::task::Task;

pub use command::{CommandAction, CommandSection};
pub use format::{FormatRules, FormatSection};
pub use tasks::TasksSection;
pub use updates::{DEFAULT_QUALIFIERS, DependencySpec, UpdatesSection, VersionFilter};

/// Everything a single plugin contributed to the graph.
#[derive(Debug, Default)]
pub struct Contribution {
    pub tasks: Vec<Task>,
    /// `(from, to)` pairs: `from` depends on `to`.
    pub dependencies: Vec<(ArcStr, ArcStr)>,
    /// `(later, earlier)` pairs: `later` must run after `earlier`.
    pub orderings: Vec<(ArcStr, ArcStr)>,
}

/// Handle passed to a plugin function.
pub struct PluginContext<'a> {
    key: &'a str,
    config: &'a BuildConfig,
    contribution: Contribution,
}

impl<'a> PluginContext<'a> {
    fn new(key: &'a str, config: &'a BuildConfig) -> Self {
        Self {
            key,
            config,
            contribution: Contribution::default(),
        }
    }

    /// The configuration key this plugin was registered under.
    pub fn key(&self) -> &str {
        self.key
    }

    pub fn config(&self) -> &BuildConfig {
        self.config
    }

    /// Deserialize this plugin's `[plugins.<key>]` section.
    pub fn section<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(self.config.plugin(self.key)?)
    }

    pub fn add_task(&mut self, task: Task) -> &mut Self {
        self.contribution.tasks.push(task);
        self
    }

    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = Task>) -> &mut Self {
        self.contribution.tasks.extend(tasks);
        self
    }

    pub fn add_dependency(&mut self, from: impl Into<ArcStr>, to: impl Into<ArcStr>) -> &mut Self {
        self.contribution.dependencies.push((from.into(), to.into()));
        self
    }

    pub fn add_ordering(&mut self, later: impl Into<ArcStr>, earlier: impl Into<ArcStr>) -> &mut Self {
        self.contribution.orderings.push((later.into(), earlier.into()));
        self
    }
}

#[derive(Clone, Copy)]
pub struct Plugin {
    pub(crate) func: fn(&mut PluginContext<'_>) -> anyhow::Result<()>,
}

impl Plugin {
    pub const fn new(func: fn(&mut PluginContext<'_>) -> anyhow::Result<()>) -> Self {
        Self { func }
    }

    /// Run the plugin against `config` and collect what it contributed.
    pub fn contribute(&self, key: &str, config: &BuildConfig) -> anyhow::Result<Contribution> {
        let mut context = PluginContext::new(key, config);
        (self.func)(&mut context)?;
        Ok(context.contribution)
    }
}

/// Configuration keys mapped to plugins, in registration order.
///
/// Registration order is also the order in which contributed tasks enter the
/// graph, which makes it the tie-break between independent tasks.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<(String, Plugin)>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in plugin:
    ///
    /// * `compile` and `lint`: an external command over declared sources.
    /// * `format`: `formatCheck` and `formatApply` for whitespace rules.
    /// * `dependencyUpdates`: reports newer stable dependency versions.
    /// * `tasks`: arbitrary user-defined command tasks.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (key, plugin) in [
            ("compile", command::PLUGIN),
            ("lint", command::PLUGIN),
            ("format", format::PLUGIN),
            ("dependencyUpdates", updates::PLUGIN),
            ("tasks", tasks::PLUGIN),
        ] {
            registry.plugins.push((key.to_string(), plugin));
        }
        registry
    }

    pub fn register(&mut self, key: impl Into<String>, plugin: Plugin) -> Result<&mut Self, PluginError> {
        let key = key.into();
        if self.contains(&key) {
            return Err(PluginError::DuplicatePlugin(key));
        }

        self.plugins.push((key, plugin));
        Ok(self)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.plugins.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|(k, _)| k.as_str())
    }

    /// Configured keys that no registered plugin answers to.
    pub fn unknown_keys<'c>(&self, config: &'c BuildConfig) -> Vec<&'c str> {
        config
            .plugin_keys()
            .filter(|key| !self.contains(key))
            .collect()
    }

    /// Invoke every plugin whose key is configured and assemble the result
    /// into a validated graph.
    pub fn apply(&self, config: &BuildConfig) -> Result<TaskGraph, PluginError> {
        for key in self.unknown_keys(config) {
            tracing::warn!("no plugin registered for configuration section 'plugins.{key}'");
        }

        let mut graph = TaskGraph::new();
        let mut edges = Vec::new();

        for (key, plugin) in &self.plugins {
            if !config.has_plugin(key) {
                continue;
            }

            let contribution = plugin
                .contribute(key, config)
                .map_err(|source| PluginError::Contribution {
                    key: key.clone(),
                    source,
                })?;

            tracing::debug!(plugin = %key, tasks = contribution.tasks.len(), "plugin applied");

            for task in contribution.tasks {
                graph.add_task(task)?;
            }
            edges.push((contribution.dependencies, contribution.orderings));
        }

        // Edges may point at tasks contributed by later plugins.
        for (dependencies, orderings) in edges {
            for (from, to) in dependencies {
                graph.add_dependency(&from, &to)?;
            }
            for (later, earlier) in orderings {
                graph.add_ordering(&later, &earlier)?;
            }
        }

        graph.link_declared()?;
        graph.validate()?;

        Ok(graph)
    }
}
