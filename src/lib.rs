#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
pub mod config;
mod core;
mod engine;
mod error;
mod graph;
mod orchestrator;
pub mod plugin;
mod task;
mod utils;

pub use crate::cache::{Fingerprint, FingerprintCache, FingerprintError, FingerprintRecord};
pub use crate::config::BuildConfig;
pub use crate::core::{ArcStr, Hash32};
pub use crate::engine::{
    ExecutionResult, Executor, ExecutorOptions, Failure, Outcome, Report, SkipReason, Status,
    default_parallelism,
};
pub use crate::error::*;
pub use crate::graph::{Edge, TaskGraph};
pub use crate::orchestrator::{Orchestrator, RunOptions};
pub use crate::plugin::{Plugin, PluginContext, PluginRegistry};
pub use crate::task::{Action, Input, Output, Task, TaskContext};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
