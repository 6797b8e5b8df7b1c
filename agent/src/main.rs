//! Entry-point for the `roundtable-agent` binary.

use clap::Parser;
use roundtable_agent::Cli;
use roundtable_agent::run_main;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_main(Cli::parse()).await
}
