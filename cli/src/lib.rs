mod cli;
mod result_file;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;
pub use cli::Cli;
use cli::Command;
use roundtable_core::DiscussionLog;
use roundtable_core::config::default_base_dir;
use roundtable_core::util::notify_on_sigint;
use roundtable_protocol::Message;
use roundtable_protocol::WORKING_DIR_KEY;

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let base_dir = match cli.base_dir {
        Some(dir) => dir,
        None => default_base_dir()?,
    };
    let log = DiscussionLog::new(base_dir);

    match cli.command {
        Command::Start {
            topic,
            agents,
            workdir,
        } => start(&log, topic, agents, workdir).await,
        Command::Ask {
            id,
            question,
            target,
        } => {
            let followup = Message::followup(question, target);
            let stamped = log.append(&id, followup).await?;
            println!(
                "follow-up recorded for round {}",
                stamped.round.unwrap_or(0)
            );
            refresh_result(&log, &id).await
        }
        Command::End {
            id,
            decision,
            consensus,
        } => {
            log.append(&id, Message::end(decision, consensus)).await?;
            println!("discussion {id} ended");
            refresh_result(&log, &id).await
        }
        Command::Show { id } => {
            let (status, messages) = load(&log, &id).await?;
            println!("{}", result_file::render(&status, &messages));
            Ok(())
        }
        Command::Status { id } => {
            let (status, _) = load(&log, &id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::List => {
            let mut summaries = log.list().await?;
            summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
            for summary in summaries {
                let status = summary.status;
                println!(
                    "{}  {:<6}  round {}  {}",
                    status.id,
                    if status.ended { "ended" } else { "active" },
                    status.current_round,
                    status.topic
                );
            }
            Ok(())
        }
        Command::Watch { id, interval_ms } => watch(&log, &id, interval_ms).await,
    }
}

async fn start(
    log: &DiscussionLog,
    topic: String,
    agents: Vec<String>,
    workdir: Option<PathBuf>,
) -> anyhow::Result<()> {
    if agents.len() < 2 {
        bail!("a discussion needs at least two agents");
    }
    let mut context = std::collections::BTreeMap::new();
    if let Some(workdir) = workdir {
        let workdir = workdir.canonicalize().unwrap_or(workdir);
        context.insert(
            WORKING_DIR_KEY.to_string(),
            workdir.to_string_lossy().into_owned(),
        );
    }
    let (id, _) = log.create(topic, agents, context).await?;
    println!("{id}");
    refresh_result(log, &id).await
}

async fn watch(log: &DiscussionLog, id: &str, interval_ms: u64) -> anyhow::Result<()> {
    let (status, _) = load(log, id).await?;
    eprintln!("watching {} ({}); Ctrl-C to stop", status.id, status.topic);

    let handle = log.watch(id, Duration::from_millis(interval_ms), |tail| {
        for message in tail {
            match serde_json::to_string(message) {
                Ok(line) => println!("{line}"),
                Err(err) => eprintln!("failed to render record: {err}"),
            }
        }
    });

    let ctrl_c = notify_on_sigint();
    ctrl_c.notified().await;
    handle.stop();
    Ok(())
}

async fn load(
    log: &DiscussionLog,
    id: &str,
) -> anyhow::Result<(roundtable_protocol::DiscussionStatus, Vec<Message>)> {
    let messages = log.read_all(id).await?;
    let status = roundtable_protocol::DiscussionStatus::derive(id, &messages)
        .with_context(|| format!("no discussion with id {id}"))?;
    Ok((status, messages))
}

/// Rewrite `<id>-result.md` from the current log contents.
async fn refresh_result(log: &DiscussionLog, id: &str) -> anyhow::Result<()> {
    let (status, messages) = load(log, id).await?;
    let markdown = result_file::render(&status, &messages);
    tokio::fs::write(log.result_path(id), markdown)
        .await
        .context("writing result file")?;
    Ok(())
}
