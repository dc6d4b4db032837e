use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "taskrun", version, about = "Lab task-runner harness")]
pub struct Cli {
    /// Recipe file (JSON) describing the tasks to run.
    #[arg(long, env = "TASKRUN_RECIPE")]
    pub recipe: PathBuf,

    /// Harness settings file; defaults to the per-user config location.
    #[arg(long, env = "TASKRUN_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
