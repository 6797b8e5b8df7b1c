//! End-to-end tests for the agent runtime driving a real (fake) CLI.
//!
//! The fake agent is a shell script, so these tests are unix-only, like
//! the sandbox suites they are modeled on.

#![cfg(unix)]
#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use roundtable_core::Config;
use roundtable_core::DiscussionLog;
use roundtable_core::LockSettings;
use roundtable_core::runtime::AgentRuntime;
use roundtable_protocol::Message;
use roundtable_protocol::Opinion;
use roundtable_protocol::Payload;
use roundtable_protocol::StatusKind;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn fast_config(agent: &str, binary: PathBuf, base_dir: &Path) -> Config {
    Config {
        agent_name: agent.to_string(),
        binary,
        agent_args: Vec::new(),
        env: HashMap::new(),
        base_dir: base_dir.to_path_buf(),
        default_workdir: base_dir.to_path_buf(),
        lock_settings: LockSettings::default(),
        poll_interval: Duration::from_millis(30),
        max_watched_discussions: 50,
        cleanup_interval: Duration::from_millis(100),
        max_concurrent: 5,
        max_queue_size: 20,
        max_rounds: 5,
        invoke_timeout: Duration::from_secs(5),
        max_retries: 3,
        retry_base_delay: Duration::from_secs(30),
        circuit_threshold: 5,
        circuit_cooldown: Duration::from_secs(60),
    }
}

async fn wait_for(
    log: &DiscussionLog,
    id: &str,
    what: &str,
    pred: impl Fn(&[Message]) -> bool,
) -> Vec<Message> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let messages = log.read_all(id).await.unwrap();
        if pred(&messages) {
            return messages;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {what}; log so far: {messages:#?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn response_from<'a>(messages: &'a [Message], agent: &str, round: u32) -> Option<&'a Message> {
    messages
        .iter()
        .find(|m| m.is_response() && m.from == agent && m.round == Some(round))
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_responds_and_advances_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "fake-claude",
        "#!/bin/sh\necho 'AGENT:claude'\necho 'I agree with the proposal.'\necho 'confidence: 0.9'\n",
    );
    let base_dir = dir.path().join("discussions");
    let runtime = Arc::new(AgentRuntime::new(fast_config(
        "claude", script, &base_dir,
    )));
    runtime.start().await.unwrap();
    let log = runtime.log().clone();

    let (id, _) = log
        .create(
            "Use REST or GraphQL?",
            vec!["claude".to_string(), "codex".to_string()],
            BTreeMap::new(),
        )
        .await
        .unwrap();

    // Round 1: the runtime notices the fresh discussion and responds.
    let messages = wait_for(&log, &id, "round 1 response", |m| {
        response_from(m, "claude", 1).is_some()
    })
    .await;

    let response = response_from(&messages, "claude", 1).unwrap();
    let Payload::Response {
        opinion,
        content,
        confidence,
    } = &response.payload
    else {
        unreachable!()
    };
    assert_eq!(*opinion, Opinion::Agree);
    assert_eq!(*confidence, 0.9);
    // Consensus closure names the counterpart.
    assert!(content.contains("I agree with codex; we can conclude this discussion."));

    // A thinking status precedes the response.
    let thinking = messages
        .iter()
        .find(|m| {
            matches!(
                m.payload,
                Payload::Status {
                    status: StatusKind::Thinking,
                    ..
                }
            )
        })
        .unwrap();
    assert!(thinking.seq < response.seq);

    // The counterpart answers; the runtime advances to round 2.
    log.append(
        &id,
        Message::response("codex", 1, Opinion::Agree, "Works for me.", 0.8),
    )
    .await
    .unwrap();
    let messages = wait_for(&log, &id, "round 2 response", |m| {
        response_from(m, "claude", 2).is_some()
    })
    .await;

    // Round identity: exactly one claude response per round.
    for round in [1, 2] {
        let count = messages
            .iter()
            .filter(|m| m.is_response() && m.from == "claude" && m.round == Some(round))
            .count();
        assert_eq!(count, 1, "round {round}");
    }

    runtime.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn watcher_is_released_after_end() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "fake-claude",
        "#!/bin/sh\necho 'AGENT:claude'\necho 'Neutral on this.'\n",
    );
    let base_dir = dir.path().join("discussions");
    let runtime = Arc::new(AgentRuntime::new(fast_config(
        "claude", script, &base_dir,
    )));
    runtime.start().await.unwrap();
    let log = runtime.log().clone();

    let (id, _) = log
        .create(
            "short lived",
            vec!["claude".to_string(), "codex".to_string()],
            BTreeMap::new(),
        )
        .await
        .unwrap();

    wait_for(&log, &id, "round 1 response", |m| {
        response_from(m, "claude", 1).is_some()
    })
    .await;
    assert!(runtime.watched_discussions().contains(&id));

    log.append(&id, Message::end("done", false)).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while runtime.watched_discussions().contains(&id) {
        assert!(
            Instant::now() < deadline,
            "watcher not released after end record"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    runtime.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_agent_appends_one_error_record() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "fake-claude",
        "#!/bin/sh\necho 'model exploded' >&2\nexit 2\n",
    );
    let base_dir = dir.path().join("discussions");
    let runtime = Arc::new(AgentRuntime::new(fast_config(
        "claude", script, &base_dir,
    )));
    runtime.start().await.unwrap();
    let log = runtime.log().clone();

    let (id, _) = log
        .create(
            "doomed",
            vec!["claude".to_string(), "codex".to_string()],
            BTreeMap::new(),
        )
        .await
        .unwrap();

    wait_for(&log, &id, "error record", |m| {
        m.iter().any(|m| matches!(&m.payload, Payload::Error { error } if error == "model exploded"))
    })
    .await;

    // The attempted-round guard keeps the failure from repeating.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let messages = log.read_all(&id).await.unwrap();
    let errors = messages
        .iter()
        .filter(|m| matches!(m.payload, Payload::Error { .. }))
        .count();
    assert_eq!(errors, 1);
    runtime.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_is_retried_with_backoff_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("second-call");
    // First call hangs past the invocation timeout; the retry answers.
    let script = write_script(
        dir.path(),
        "fake-claude",
        &format!(
            "#!/bin/sh\nif [ -f '{0}' ]; then\n  echo 'AGENT:claude'\n  echo 'Back after the retry. I agree.'\nelse\n  : > '{0}'\n  sleep 30\nfi\n",
            marker.display()
        ),
    );
    let base_dir = dir.path().join("discussions");
    let mut config = fast_config("claude", script, &base_dir);
    config.invoke_timeout = Duration::from_millis(200);
    config.retry_base_delay = Duration::from_millis(50);
    let runtime = Arc::new(AgentRuntime::new(config));
    runtime.start().await.unwrap();
    let log = runtime.log().clone();

    let (id, _) = log
        .create(
            "slow model",
            vec!["claude".to_string(), "codex".to_string()],
            BTreeMap::new(),
        )
        .await
        .unwrap();

    let messages = wait_for(&log, &id, "response after timeout retry", |m| {
        response_from(m, "claude", 1).is_some()
    })
    .await;

    // The full audit trail, in order: start, one thinking record for the
    // turn, retrying 1/3, then the response. The retry must not repeat
    // the thinking record.
    let kinds: Vec<&str> = messages
        .iter()
        .map(|m| match &m.payload {
            Payload::Start { .. } => "start",
            Payload::Status {
                status: StatusKind::Thinking,
                ..
            } => "thinking",
            Payload::Status {
                status: StatusKind::Retrying,
                ..
            } => "retrying",
            Payload::Response { .. } => "response",
            other => panic!("unexpected record: {other:?}"),
        })
        .collect();
    assert_eq!(kinds, vec!["start", "thinking", "retrying", "response"]);
    assert!(messages.iter().any(|m| matches!(
        &m.payload,
        Payload::Status {
            status: StatusKind::Retrying,
            content,
        } if content == "1/3"
    )));
    runtime.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_header_gets_one_retry_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("second-call");
    let script = write_script(
        dir.path(),
        "fake-claude",
        &format!(
            "#!/bin/sh\nif [ -f '{0}' ]; then\n  echo 'AGENT:claude'\n  echo 'Agreed, shipping it.'\nelse\n  : > '{0}'\n  echo 'AGENT:codex'\n  echo 'impersonating'\nfi\n",
            marker.display()
        ),
    );
    let base_dir = dir.path().join("discussions");
    let runtime = Arc::new(AgentRuntime::new(fast_config(
        "claude", script, &base_dir,
    )));
    runtime.start().await.unwrap();
    let log = runtime.log().clone();

    let (id, _) = log
        .create(
            "identity check",
            vec!["claude".to_string(), "codex".to_string()],
            BTreeMap::new(),
        )
        .await
        .unwrap();

    let messages = wait_for(&log, &id, "response after identity retry", |m| {
        response_from(m, "claude", 1).is_some()
    })
    .await;

    let retrying = messages.iter().any(|m| {
        matches!(
            &m.payload,
            Payload::Status {
                status: StatusKind::Retrying,
                content,
            } if content.contains("identity check failed")
        )
    });
    assert!(retrying, "expected a retrying status record");
    runtime.stop();
}
