use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "Daemon that answers for one agent in roundtable discussions")]
pub struct Cli {
    /// Which agent this daemon speaks for (`claude`, `codex`, or any name
    /// when --binary is given).
    #[arg(long, short = 'a')]
    pub agent: String,

    /// External CLI binary. Defaults to the preset lookup (env override,
    /// then PATH).
    #[arg(long)]
    pub binary: Option<PathBuf>,

    /// Directory holding the discussion logs.
    #[arg(long, value_name = "DIR")]
    pub base_dir: Option<PathBuf>,

    /// Default working directory for CLI invocations. Discussions that
    /// carry a workingDir in their context override this.
    #[arg(long = "workdir", short = 'C', value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Watcher poll period in milliseconds.
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Maximum simultaneous response attempts across all discussions.
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Round cap per discussion.
    #[arg(long)]
    pub max_rounds: Option<u32>,
}
