use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

#[derive(Parser, Debug)]
#[command(version, about = "Create and steer multi-agent discussions")]
pub struct Cli {
    /// Directory holding the discussion logs.
    #[arg(long, global = true, value_name = "DIR")]
    pub base_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a new discussion and print its id.
    Start {
        #[arg(long)]
        topic: String,
        /// Comma-separated agent names, e.g. `claude,codex`.
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        agents: Vec<String>,
        /// Working directory the agents should operate in.
        #[arg(long, value_name = "DIR")]
        workdir: Option<PathBuf>,
    },
    /// Append a follow-up question, optionally addressed to one agent.
    Ask {
        id: String,
        question: String,
        #[arg(long)]
        target: Option<String>,
    },
    /// Close a discussion with a decision.
    End {
        id: String,
        decision: String,
        /// Record that the participants reached consensus.
        #[arg(long, default_value_t = false)]
        consensus: bool,
    },
    /// Print the rendered conversation.
    Show { id: String },
    /// Print the status summary as JSON.
    Status { id: String },
    /// List discussions under the base directory.
    List,
    /// Stream new records to stdout until interrupted.
    Watch {
        id: String,
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
    },
}
