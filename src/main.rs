use std::num::NonZeroUsize;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;
use shikumi::{Orchestrator, RunOptions, ShikumiError};

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
struct Args {
    /// Path to the build configuration.
    #[clap(long, global = true, default_value = shikumi::config::DEFAULT_CONFIG)]
    config: Utf8PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the given tasks and everything they depend on.
    Run {
        /// Tasks to run. Runs every task when empty.
        tasks: Vec<String>,
        /// Ignore recorded fingerprints and run every scheduled task.
        #[clap(long)]
        no_incremental: bool,
        /// Withhold tasks sharing a dependency chain with a failure.
        #[clap(long, overrides_with = "no_fail_fast")]
        fail_fast: bool,
        /// Keep running independent tasks after a failure.
        #[clap(long, overrides_with = "fail_fast")]
        no_fail_fast: bool,
        /// Number of tasks run in parallel.
        #[clap(long, short = 'j')]
        parallelism: Option<NonZeroUsize>,
        /// Write a JSON report of the run to this path.
        #[clap(long)]
        report: Option<Utf8PathBuf>,
    },
    /// List every configured task.
    Tasks,
    /// Print the task graph as a Mermaid diagram.
    Graph,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = shikumi::init_logging() {
        eprintln!("{} couldn't initialize logging: {err}", style("warning:").yellow());
    }

    match execute(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err}", style("error:").red().bold());
            ExitCode::from(2)
        }
    }
}

fn execute(args: Args) -> Result<ExitCode, ShikumiError> {
    let orchestrator = Orchestrator::from_path(&args.config)?;

    match args.command {
        Command::Run {
            tasks,
            no_incremental,
            fail_fast,
            no_fail_fast,
            parallelism,
            report,
        } => {
            let options = RunOptions {
                no_incremental,
                fail_fast: match (fail_fast, no_fail_fast) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                parallelism,
                report,
            };

            let report = orchestrator.run(&tasks, &options)?;
            println!("{report}");

            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Tasks => {
            print!("{}", orchestrator.describe_tasks()?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Graph => {
            print!("{}", orchestrator.graph()?.to_mermaid());
            Ok(ExitCode::SUCCESS)
        }
    }
}
