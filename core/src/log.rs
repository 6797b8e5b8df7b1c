//! Append-only per-discussion logs plus the sibling lock files.
//!
//! Each discussion is one `<id>.jsonl` file under the base directory. The
//! log is shared across cooperating processes on the same filesystem;
//! writers synchronize through the create-exclusive lock file and hold it
//! for the entire read-assign-append sequence so sequence numbers stay
//! unique and ordered. The lock is never held across a child-process
//! invocation.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use roundtable_protocol::DiscussionStatus;
use roundtable_protocol::Message;
use roundtable_protocol::now_rfc3339;
use tokio::task::JoinHandle;

use crate::codec::decode_lines;
use crate::codec::encode_line;
use crate::error::Result;
use crate::error::RoundtableErr;
use crate::lockfile;
use crate::lockfile::LockSettings;
use crate::util::generate_discussion_id;

#[derive(Clone)]
pub struct DiscussionLog {
    base_dir: PathBuf,
    lock_settings: LockSettings,
}

/// One row of `list()`: enough for the runtime's watcher prioritization
/// without a second read.
#[derive(Debug, Clone)]
pub struct DiscussionSummary {
    pub id: String,
    pub status: DiscussionStatus,
    /// Filesystem mtime of the log, i.e. the most recent append.
    pub last_activity: SystemTime,
}

impl DiscussionLog {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock_settings: LockSettings::default(),
        }
    }

    pub fn with_lock_settings(base_dir: impl Into<PathBuf>, lock_settings: LockSettings) -> Self {
        Self {
            base_dir: base_dir.into(),
            lock_settings,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.jsonl"))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.jsonl.lock"))
    }

    /// Where the external result renderer writes its markdown summary.
    pub fn result_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}-result.md"))
    }

    /// Create a new discussion: generate an id and write the sole `start`
    /// record with `seq = 1`. The log file is opened create-exclusive, so
    /// an id collision fails instead of clobbering.
    pub async fn create(
        &self,
        topic: impl Into<String>,
        participants: Vec<String>,
        context: BTreeMap<String, String>,
    ) -> Result<(String, Message)> {
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let id = generate_discussion_id();
        let mut start = Message::start(topic, participants, context);
        start.seq = 1;
        start.ts = now_rfc3339();

        let line = encode_line(&start)?;
        let path = self.log_path(&id);
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)?;
            file.write_all(line.as_bytes())?;
            file.flush()
        })
        .await?;

        match result {
            Ok(()) => Ok((id, start)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(RoundtableErr::DiscussionExists(id))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Append one record, assigning `seq`, the follow-up round when the
    /// caller did not supply one, and `ts`, all under the discussion lock.
    /// Returns the fully stamped record.
    pub async fn append(&self, id: &str, mut message: Message) -> Result<Message> {
        let lock = lockfile::acquire(&self.lock_path(id), &self.lock_settings).await?;

        let existing = self.read_all(id).await?;
        if existing.is_empty() {
            // `create` writes the start record directly, so an empty read
            // means there is no discussion to append to.
            return Err(RoundtableErr::MissingStart(id.to_string()));
        }

        let last_seq = existing.last().map(|m| m.seq).unwrap_or(0);
        message.seq = last_seq + 1;
        if message.is_followup() && message.round.is_none() {
            message.round = Some(next_followup_round(&existing));
        }
        message.ts = now_rfc3339();

        let line = encode_line(&message)?;
        let path = self.log_path(id);
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
            // Single write so concurrent readers never observe half a
            // record followed by the newline of another.
            file.write_all(line.as_bytes())?;
            file.flush()
        })
        .await??;

        lock.release();
        Ok(message)
    }

    /// Read and parse the full log. A missing file is an empty discussion,
    /// not an error.
    pub async fn read_all(&self, id: &str) -> Result<Vec<Message>> {
        match tokio::fs::read_to_string(self.log_path(id)).await {
            Ok(content) => Ok(decode_lines(&content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn status(&self, id: &str) -> Result<Option<DiscussionStatus>> {
        let messages = self.read_all(id).await?;
        Ok(DiscussionStatus::derive(id, &messages))
    }

    /// Enumerate every discussion under the base directory.
    pub async fn list(&self) -> Result<Vec<DiscussionSummary>> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let last_activity = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if let Some(status) = self.status(&id).await? {
                summaries.push(DiscussionSummary {
                    id,
                    status,
                    last_activity,
                });
            }
        }
        Ok(summaries)
    }

    /// Poll the log every `interval`; when new records appear, hand the
    /// tail slice to `callback`. Polling continues until the returned
    /// handle is stopped or dropped.
    pub fn watch(
        &self,
        id: &str,
        interval: Duration,
        mut callback: impl FnMut(&[Message]) + Send + 'static,
    ) -> WatchHandle {
        let log = self.clone();
        let id = id.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut seen_seq = 0u64;
            loop {
                ticker.tick().await;
                let messages = match log.read_all(&id).await {
                    Ok(messages) => messages,
                    Err(err) => {
                        tracing::warn!(%id, %err, "watch poll failed");
                        continue;
                    }
                };
                let last_seq = messages.last().map(|m| m.seq).unwrap_or(0);
                if last_seq > seen_seq {
                    let tail: Vec<Message> =
                        messages.into_iter().filter(|m| m.seq > seen_seq).collect();
                    seen_seq = last_seq;
                    callback(&tail);
                }
            }
        });
        WatchHandle { handle }
    }
}

/// Round assigned to a follow-up appended without one:
/// `max(existing response rounds, 0) + 1`.
fn next_followup_round(messages: &[Message]) -> u32 {
    messages
        .iter()
        .filter(|m| m.is_response())
        .filter_map(|m| m.round)
        .max()
        .unwrap_or(0)
        + 1
}

pub struct WatchHandle {
    handle: JoinHandle<()>,
}

impl WatchHandle {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use roundtable_protocol::Opinion;
    use roundtable_protocol::Payload;
    use roundtable_protocol::StatusKind;

    fn test_log(dir: &tempfile::TempDir) -> DiscussionLog {
        DiscussionLog::new(dir.path())
    }

    async fn seeded(log: &DiscussionLog) -> String {
        let (id, _) = log
            .create(
                "tabs or spaces",
                vec!["claude".to_string(), "codex".to_string()],
                BTreeMap::new(),
            )
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn create_then_read_yields_single_start() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir);
        let (id, start) = log
            .create("tabs or spaces", vec!["claude".to_string()], BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(start.seq, 1);

        let messages = log.read_all(&id).await.unwrap();
        assert_eq!(messages, vec![start]);
    }

    #[tokio::test]
    async fn append_assigns_monotone_seq_and_ts() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir);
        let id = seeded(&log).await;

        let first = log
            .append(
                &id,
                Message::response("claude", 1, Opinion::Agree, "spaces", 0.8),
            )
            .await
            .unwrap();
        let second = log
            .append(
                &id,
                Message::response("codex", 1, Opinion::Agree, "spaces", 0.7),
            )
            .await
            .unwrap();
        assert_eq!(first.seq, 2);
        assert_eq!(second.seq, 3);
        assert!(!first.ts.is_empty());
        assert!(!log.lock_path(&id).exists());
    }

    #[tokio::test]
    async fn followup_round_is_assigned_at_append_time() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir);
        let id = seeded(&log).await;

        // No responses yet: the first follow-up lands in round 1.
        let early = log
            .append(&id, Message::followup("anything?", None))
            .await
            .unwrap();
        assert_eq!(early.round, Some(1));

        log.append(
            &id,
            Message::response("claude", 1, Opinion::Agree, "spaces", 0.8),
        )
        .await
        .unwrap();
        log.append(
            &id,
            Message::response("codex", 1, Opinion::Agree, "spaces", 0.9),
        )
        .await
        .unwrap();

        let followup = log
            .append(&id, Message::followup("what about editors?", None))
            .await
            .unwrap();
        assert_eq!(followup.round, Some(2));

        // A pre-assigned round is respected.
        let pinned = log
            .append(
                &id,
                Message::unstamped(
                    "user",
                    Some(5),
                    Payload::Followup {
                        content: "pinned".to_string(),
                        target: None,
                    },
                ),
            )
            .await
            .unwrap();
        assert_eq!(pinned.round, Some(5));
    }

    #[tokio::test]
    async fn append_to_missing_discussion_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir);
        let err = log
            .append("deadbeef", Message::followup("hello?", None))
            .await
            .unwrap_err();
        assert!(matches!(err, RoundtableErr::MissingStart(_)));
    }

    #[tokio::test]
    async fn read_of_missing_discussion_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir);
        assert!(log.read_all("deadbeef").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_seq_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir);
        let id = seeded(&log).await;

        let mut tasks = Vec::new();
        for writer in 0..4 {
            let log = log.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..5 {
                    log.append(
                        &id,
                        Message::status(
                            format!("writer-{writer}"),
                            None,
                            StatusKind::Thinking,
                            format!("tick {i}"),
                        ),
                    )
                    .await
                    .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let messages = log.read_all(&id).await.unwrap();
        assert_eq!(messages.len(), 21);
        let seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
        let expected: Vec<u64> = (1..=21).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn status_flips_to_ended_on_end_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir);
        let id = seeded(&log).await;

        let status = log.status(&id).await.unwrap().unwrap();
        assert!(!status.ended);

        log.append(&id, Message::end("spaces", true)).await.unwrap();
        let status = log.status(&id).await.unwrap().unwrap();
        assert!(status.ended);
        assert!(status.ended_at.is_some());
    }

    #[tokio::test]
    async fn list_enumerates_discussions() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir);
        let a = seeded(&log).await;
        let b = seeded(&log).await;

        let mut ids: Vec<String> = log.list().await.unwrap().into_iter().map(|s| s.id).collect();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn watch_delivers_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = test_log(&dir);
        let id = seeded(&log).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = log.watch(&id, Duration::from_millis(20), move |tail| {
            for message in tail {
                tx.send(message.seq).ok();
            }
        });

        // First tick delivers the start record.
        assert_eq!(rx.recv().await, Some(1));

        log.append(
            &id,
            Message::response("claude", 1, Opinion::Neutral, "hm", 0.7),
        )
        .await
        .unwrap();
        assert_eq!(rx.recv().await, Some(2));

        handle.stop();
    }
}
