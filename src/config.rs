//! Build configuration, read from `shikumi.toml`.
//!
//! ```toml
//! failFast = true
//! parallelism = 4
//! incrementalCache = ".shikumi/fingerprints.cbor"
//!
//! [plugins.compile]
//! command = "javac"
//! args = ["-Xlint:all", "-Werror", "-d", "build/classes"]
//! sources = ["src/**/*.java"]
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::fs;
use std::num::NonZeroUsize;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::engine::default_parallelism;
use crate::error::ConfigError;

pub const DEFAULT_CONFIG: &str = "shikumi.toml";
pub const DEFAULT_CACHE: &str = ".shikumi/fingerprints.cbor";

/// Raw shape of the configuration file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    #[serde(default = "default_fail_fast")]
    fail_fast: bool,
    parallelism: Option<usize>,
    incremental_cache: Option<Utf8PathBuf>,
    #[serde(default)]
    plugins: toml::Table,
}

fn default_fail_fast() -> bool {
    true
}

/// Resolved configuration of one build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub fail_fast: bool,
    pub parallelism: NonZeroUsize,
    /// Location of the persisted fingerprints, already resolved against `root`.
    pub incremental_cache: Utf8PathBuf,
    /// Project root. Declared task inputs and outputs are relative to it.
    pub root: Utf8PathBuf,
    plugins: toml::Table,
}

impl BuildConfig {
    /// Default configuration for a project rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        let root = root.into();
        Self {
            fail_fast: true,
            parallelism: default_parallelism(),
            incremental_cache: root.join(DEFAULT_CACHE),
            root,
            plugins: toml::Table::new(),
        }
    }

    /// Read the configuration file at `path`. Its parent directory becomes
    /// the project root.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_owned(), e))?;

        let root = match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_owned(),
            _ => Utf8PathBuf::from("."),
        };

        Self::parse(&source, path, root)
    }

    /// Parse configuration from a string. `origin` is only used in error
    /// messages.
    pub fn parse(
        source: &str,
        origin: impl AsRef<Utf8Path>,
        root: impl Into<Utf8PathBuf>,
    ) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(source)
            .map_err(|e| ConfigError::Parse(origin.as_ref().to_owned(), e))?;

        let root = root.into();
        let parallelism = match file.parallelism {
            Some(n) => NonZeroUsize::new(n).ok_or(ConfigError::Parallelism)?,
            None => default_parallelism(),
        };
        let incremental_cache = root.join(
            file.incremental_cache
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_CACHE)),
        );

        Ok(Self {
            fail_fast: file.fail_fast,
            parallelism,
            incremental_cache,
            root,
            plugins: file.plugins,
        })
    }

    /// Keys of all `[plugins.<key>]` sections, sorted.
    pub fn plugin_keys(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn has_plugin(&self, key: &str) -> bool {
        self.plugins.contains_key(key)
    }

    /// Deserialize the `[plugins.<key>]` section into `T`. A missing section
    /// deserializes from an empty table, so `T` decides its own defaults.
    pub fn plugin<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        let section = match self.plugins.get(key) {
            Some(value) => value.clone(),
            None => toml::Value::Table(toml::Table::new()),
        };

        section
            .try_into()
            .map_err(|e| ConfigError::Plugin(key.to_string(), e))
    }

    /// Enable a plugin with the given section, replacing any previous one.
    pub fn set_plugin(&mut self, key: impl Into<String>, section: toml::Table) -> &mut Self {
        self.plugins.insert(key.into(), toml::Value::Table(section));
        self
    }
}
