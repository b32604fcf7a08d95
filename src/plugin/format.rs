//! Whitespace and license header formatting of text files.
//!
//! Contributes two tasks over the same set of `targets`:
//!
//! * `formatCheck` fails when any target violates the rules and lists them.
//! * `formatApply` rewrites the offending targets in place.
//!
//! `formatCheck` runs after `formatApply` when both are scheduled.

use std::borrow::Cow;
use std::fs;
use std::io::ErrorKind;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::cache::expand_glob;
use crate::plugin::command::input;
use crate::plugin::{Plugin, PluginContext};
use crate::task::{Input, Task, TaskContext};

fn yes() -> bool {
    true
}

/// The `[plugins.format]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FormatSection {
    /// Glob patterns of files to format, relative to the project root.
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default = "yes")]
    pub trim_trailing_whitespace: bool,
    #[serde(default = "yes")]
    pub end_with_newline: bool,
    /// File holding a header every target must start with, relative to the
    /// project root.
    pub license_header: Option<Utf8PathBuf>,
    /// Tasks `formatApply` is ordered after.
    #[serde(default)]
    pub must_run_after: Vec<String>,
    #[serde(default = "yes")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatRules {
    pub trim_trailing_whitespace: bool,
    pub end_with_newline: bool,
    /// Text prepended to targets that don't already start with it.
    pub license_header: Option<String>,
}

impl FormatRules {
    /// Format `text`, borrowing it back unchanged when it already conforms.
    pub fn apply<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);

        if let Some(header) = &self.license_header {
            if !out.starts_with(header.as_str()) {
                out = Cow::Owned(format!("{header}{out}"));
            }
        }

        if self.trim_trailing_whitespace {
            let trimmed = trim_lines(&out);
            if trimmed != *out {
                out = Cow::Owned(trimmed);
            }
        }

        if self.end_with_newline && !out.is_empty() {
            let body = out.trim_end_matches(['\n', '\r']);
            let ending = &out[body.len()..];
            if ending != "\n" && ending != "\r\n" {
                let newline = if ending.starts_with("\r\n") { "\r\n" } else { "\n" };
                out = Cow::Owned(format!("{body}{newline}"));
            }
        }

        out
    }

    fn describe(&self) -> String {
        let mut out = format!(
            "trimTrailingWhitespace={} endWithNewline={}",
            self.trim_trailing_whitespace, self.end_with_newline
        );
        if let Some(header) = &self.license_header {
            out.push_str(" licenseHeader=");
            out.push_str(header);
        }
        out
    }

    /// Read the header from `path`, normalized so that formatted targets keep
    /// starting with it.
    fn load_license_header(&mut self, path: &Utf8Path) -> anyhow::Result<()> {
        let mut header = fs::read_to_string(path)
            .with_context(|| format!("Couldn't read license header {path}"))?;

        if self.trim_trailing_whitespace {
            header = trim_lines(&header);
        }
        if !header.ends_with('\n') {
            header.push('\n');
        }

        self.license_header = Some(header);
        Ok(())
    }
}

fn trim_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for line in text.split_inclusive('\n') {
        let (body, ending) = if let Some(body) = line.strip_suffix("\r\n") {
            (body, "\r\n")
        } else if let Some(body) = line.strip_suffix('\n') {
            (body, "\n")
        } else {
            (line, "")
        };

        out.push_str(body.trim_end_matches([' ', '\t']));
        out.push_str(ending);
    }

    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Check,
    Apply,
}

struct FormatAction {
    targets: Vec<String>,
    rules: FormatRules,
    mode: Mode,
}

impl FormatAction {
    fn files(&self, root: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
        let mut files = Vec::new();
        for pattern in &self.targets {
            files.extend(expand_glob(root, pattern)?);
        }
        files.sort();
        files.dedup();
        Ok(files)
    }
}

impl crate::task::Action for FormatAction {
    fn execute(&self, context: &mut TaskContext<'_>) -> anyhow::Result<()> {
        let root = context.root().to_owned();
        let mut offending = Vec::new();

        for path in self.files(&root)? {
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                // Not UTF-8 text, nothing to format.
                Err(e) if e.kind() == ErrorKind::InvalidData => continue,
                Err(e) => return Err(e).with_context(|| format!("Couldn't read {path}")),
            };

            let formatted = self.rules.apply(&text);
            if let Cow::Owned(formatted) = formatted {
                let relative = path.strip_prefix(&root).unwrap_or(&path).to_owned();
                if self.mode == Mode::Apply {
                    fs::write(&path, formatted)
                        .with_context(|| format!("Couldn't write {path}"))?;
                    context.emit(format!("formatted {relative}"));
                }
                offending.push(relative);
            }
        }

        if self.mode == Mode::Check && !offending.is_empty() {
            for path in &offending {
                context.emit(format!("  {path}"));
            }
            bail!(
                "{} file(s) violate the format rules, run formatApply to fix them",
                offending.len()
            );
        }

        Ok(())
    }
}

fn contribute(ctx: &mut PluginContext<'_>) -> anyhow::Result<()> {
    let section: FormatSection = ctx.section()?;
    let mut rules = FormatRules {
        trim_trailing_whitespace: section.trim_trailing_whitespace,
        end_with_newline: section.end_with_newline,
        license_header: None,
    };

    if let Some(path) = &section.license_header {
        rules.load_license_header(&ctx.config().root.join(path))?;
    }

    let declared: Vec<Input> = std::iter::once(Input::Value(rules.describe()))
        .chain(section.targets.iter().map(|target| input(target)))
        .collect();

    let check = Task::with_action(
        "formatCheck",
        FormatAction {
            targets: section.targets.clone(),
            rules: rules.clone(),
            mode: Mode::Check,
        },
    )
    .describe("Checks that the formatting targets conform to the rules")
    .inputs(declared.clone())
    .enabled(section.enabled);

    let mut apply = Task::with_action(
        "formatApply",
        FormatAction {
            targets: section.targets,
            rules,
            mode: Mode::Apply,
        },
    )
    .describe("Rewrites formatting targets so they conform to the rules")
    .inputs(declared)
    .enabled(section.enabled);

    for earlier in section.must_run_after {
        apply = apply.must_run_after(earlier);
    }

    ctx.add_task(check)
        .add_task(apply)
        .add_ordering("formatCheck", "formatApply");
    Ok(())
}

pub(crate) const PLUGIN: Plugin = Plugin::new(contribute);
