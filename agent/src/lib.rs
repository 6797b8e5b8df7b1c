mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
pub use cli::Cli;
use roundtable_core::Config;
use roundtable_core::agents;
use roundtable_core::runtime::AgentRuntime;
use roundtable_core::util::notify_on_sigint;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let default_level = "info";
    let _ = tracing_subscriber::fmt()
        // Fallback to the `default_level` log filter if the environment
        // variable is not set _or_ contains an invalid value
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    // Anything that fails from here to `start()` is a startup error and
    // exits nonzero; after that the daemon survives any single failure.
    let (binary, args) = match agents::preset(&cli.agent) {
        Some(preset) => {
            let binary = match &cli.binary {
                Some(binary) => binary.clone(),
                None => preset
                    .resolve_binary()
                    .with_context(|| format!("resolving CLI for agent `{}`", cli.agent))?,
            };
            (binary, preset.args_vec())
        }
        None => {
            let binary = cli.binary.clone().with_context(|| {
                format!("agent `{}` has no preset; pass --binary", cli.agent)
            })?;
            (binary, Vec::new())
        }
    };

    let mut config = Config::new(&cli.agent, binary)?;
    config.agent_args = args;
    if let Some(base_dir) = cli.base_dir {
        config.base_dir = base_dir;
    }
    if let Some(workdir) = cli.workdir {
        config.default_workdir = workdir.canonicalize().unwrap_or(workdir);
    }
    if let Some(poll_ms) = cli.poll_interval_ms {
        config.poll_interval = Duration::from_millis(poll_ms);
    }
    if let Some(max_concurrent) = cli.max_concurrent {
        config.max_concurrent = max_concurrent;
    }
    if let Some(max_rounds) = cli.max_rounds {
        config.max_rounds = max_rounds;
    }

    let runtime = Arc::new(AgentRuntime::new(config));
    runtime
        .start()
        .await
        .context("starting the agent runtime")?;
    info!(agent = %cli.agent, "watching for discussions; Ctrl-C to stop");

    let ctrl_c = notify_on_sigint();
    ctrl_c.notified().await;
    runtime.stop();
    Ok(())
}
