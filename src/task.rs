//! All the generic task-related abstractions.
//!
//! A [`Task`] is a named unit of work. It owns an [`Action`], which is the
//! opaque executable part, and declares what it depends on, what it reads
//! ([`Input`]) and what it produces ([`Output`]). The declarations are what
//! the executor fingerprints to decide whether a task may be skipped; the
//! action itself is never inspected.

use std::borrow::Cow;
use std::fmt::{Debug, Write as _};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::ArcStr;

/// A declared input of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Input {
    /// A single file or a directory (walked recursively).
    Path(Utf8PathBuf),
    /// A glob pattern relative to the project root, e.g. `src/**/*.rs`.
    Glob(String),
    /// A literal value, e.g. compiler flags. Changing it invalidates the task.
    Value(String),
}

/// A declared output of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Output {
    /// A single file or a directory (walked recursively).
    Path(Utf8PathBuf),
    /// A glob pattern relative to the project root.
    Glob(String),
}

/// Context handed to a running [`Action`].
///
/// Anything written into it is captured as the diagnostic output of the task
/// and ends up in its [`ExecutionResult`](crate::ExecutionResult).
pub struct TaskContext<'a> {
    name: &'a str,
    root: &'a Utf8Path,
    span: tracing::Span,
    output: String,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(name: &'a str, root: &'a Utf8Path, span: tracing::Span) -> Self {
        Self {
            name,
            root,
            span,
            output: String::new(),
        }
    }

    /// Name of the running task.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Project root; relative paths in declarations resolve against it.
    pub fn root(&self) -> &Utf8Path {
        self.root
    }

    /// Resolve a declared path against the project root.
    pub fn resolve(&self, path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.root.join(path)
    }

    /// Tracing span of the running task.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Append one line of diagnostic output.
    pub fn emit(&mut self, line: impl AsRef<str>) {
        let _ = writeln!(self.output, "{}", line.as_ref());
    }

    /// Append raw diagnostic output verbatim.
    pub fn emit_raw(&mut self, text: impl AsRef<str>) {
        self.output.push_str(text.as_ref());
    }

    pub(crate) fn into_output(self) -> String {
        self.output
    }
}

/// The executable part of a task.
///
/// Implemented for any `Fn(&mut TaskContext) -> anyhow::Result<()>`, so most
/// tasks are just closures.
pub trait Action: Send + Sync {
    fn execute(&self, context: &mut TaskContext<'_>) -> anyhow::Result<()>;
}

impl<F> Action for F
where
    F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, context: &mut TaskContext<'_>) -> anyhow::Result<()> {
        self(context)
    }
}

/// A named unit of work with declared dependencies, inputs, and outputs.
#[derive(Clone)]
pub struct Task {
    pub(crate) name: ArcStr,
    pub(crate) description: Option<Cow<'static, str>>,
    pub(crate) action: Arc<dyn Action>,
    pub(crate) depends_on: Vec<ArcStr>,
    pub(crate) must_run_after: Vec<ArcStr>,
    pub(crate) inputs: Vec<Input>,
    pub(crate) outputs: Vec<Output>,
    pub(crate) enabled: bool,
}

impl Task {
    /// Create a task from a closure.
    pub fn new<F>(name: impl Into<ArcStr>, callback: F) -> Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::with_action(name, callback)
    }

    pub fn with_action<A>(name: impl Into<ArcStr>, action: A) -> Self
    where
        A: Action + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            action: Arc::new(action),
            depends_on: Vec::new(),
            must_run_after: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            enabled: true,
        }
    }

    pub fn describe(mut self, description: impl Into<Cow<'static, str>>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn depends_on(mut self, name: impl Into<ArcStr>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Order this task after `name` whenever both run, without depending on it.
    pub fn must_run_after(mut self, name: impl Into<ArcStr>) -> Self {
        self.must_run_after.push(name.into());
        self
    }

    pub fn input(mut self, input: Input) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn inputs(mut self, inputs: impl IntoIterator<Item = Input>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn output(mut self, output: Output) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn outputs(mut self, outputs: impl IntoIterator<Item = Output>) -> Self {
        self.outputs.extend(outputs);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn declared_inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn declared_outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn dependencies(&self) -> &[ArcStr] {
        &self.depends_on
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Tasks that declare nothing can't be fingerprinted, so they always run.
    pub(crate) fn is_trackable(&self) -> bool {
        !self.inputs.is_empty() || !self.outputs.is_empty()
    }

    pub(crate) fn execute(&self, context: &mut TaskContext<'_>) -> anyhow::Result<()> {
        self.action.execute(context)
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}
