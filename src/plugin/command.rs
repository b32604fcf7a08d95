use std::process::Command;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::plugin::{Plugin, PluginContext};
use crate::task::{Action, Input, Output, Task, TaskContext};

/// Runs an external program from the project root.
///
/// Stdout and stderr are captured into the task output. A nonzero exit status
/// fails the task.
#[derive(Debug, Clone)]
pub struct CommandAction {
    program: String,
    args: Vec<String>,
}

impl CommandAction {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The full command line, used both in messages and as a fingerprint input.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl Action for CommandAction {
    fn execute(&self, context: &mut TaskContext<'_>) -> anyhow::Result<()> {
        tracing::debug!(task = context.name(), "spawning `{}`", self.command_line());

        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(context.root())
            .output()
            .with_context(|| format!("Couldn't spawn `{}`", self.program))?;

        context.emit_raw(String::from_utf8_lossy(&output.stdout));
        context.emit_raw(String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            bail!("`{}` exited with {}", self.command_line(), output.status);
        }

        Ok(())
    }
}

fn yes() -> bool {
    true
}

/// A `[plugins.compile]`, `[plugins.lint]` or `[plugins.tasks.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CommandSection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Files read by the command: paths, directories, or glob patterns.
    #[serde(default, alias = "inputs")]
    pub sources: Vec<String>,
    /// Files produced by the command: paths, directories, or glob patterns.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub must_run_after: Vec<String>,
    #[serde(default = "yes")]
    pub enabled: bool,
    pub description: Option<String>,
}

impl CommandSection {
    pub fn into_task(self, name: &str) -> Task {
        let action = CommandAction::new(self.command, self.args);

        let mut task = Task::with_action(name, action.clone()).enabled(self.enabled);

        // Tasks that declare no files stay untracked.
        if !self.sources.is_empty() || !self.outputs.is_empty() {
            task = task
                .input(Input::Value(action.command_line()))
                .inputs(self.sources.iter().map(|s| input(s)))
                .outputs(self.outputs.iter().map(|s| output(s)));
        }

        for dependency in self.depends_on {
            task = task.depends_on(dependency);
        }
        for earlier in self.must_run_after {
            task = task.must_run_after(earlier);
        }

        match self.description {
            Some(description) => task.describe(description),
            None => task.describe(format!("Runs `{}`", action.command_line())),
        }
    }
}

fn is_pattern(value: &str) -> bool {
    value.contains(['*', '?', '['])
}

pub(crate) fn input(value: &str) -> Input {
    if is_pattern(value) {
        Input::Glob(value.to_string())
    } else {
        Input::Path(value.into())
    }
}

pub(crate) fn output(value: &str) -> Output {
    if is_pattern(value) {
        Output::Glob(value.to_string())
    } else {
        Output::Path(value.into())
    }
}

/// Contributes a single command task named after the plugin key.
fn contribute(ctx: &mut PluginContext<'_>) -> anyhow::Result<()> {
    let section: CommandSection = ctx.section()?;
    let task = section.into_task(ctx.key());
    ctx.add_task(task);
    Ok(())
}

pub(crate) const PLUGIN: Plugin = Plugin::new(contribute);
