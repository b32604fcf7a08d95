use std::collections::BTreeMap;

use crate::plugin::command::CommandSection;
use crate::plugin::{Plugin, PluginContext};

/// `[plugins.tasks.<name>]` sections, keyed by task name.
pub type TasksSection = BTreeMap<String, CommandSection>;

/// Contributes one command task per section, in name order.
fn contribute(ctx: &mut PluginContext<'_>) -> anyhow::Result<()> {
    let section: TasksSection = ctx.section()?;
    ctx.add_tasks(
        section
            .into_iter()
            .map(|(name, command)| command.into_task(&name)),
    );
    Ok(())
}

pub(crate) const PLUGIN: Plugin = Plugin::new(contribute);
