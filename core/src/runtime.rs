// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! The per-agent daemon runtime: watches discussions, decides turns,
//! bounds concurrent child invocations, retries timeouts, and opens a
//! per-discussion circuit after repeated failures.
//!
//! All mutable state lives in one `Mutex<RuntimeState>`; the lock is only
//! ever held for short synchronous sections, never across an await.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use roundtable_protocol::DiscussionStatus;
use roundtable_protocol::Message;
use roundtable_protocol::StatusKind;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::error::Rejection;
use crate::error::Result;
use crate::error::RoundtableErr;
use crate::exec;
use crate::exec::InvokeRequest;
use crate::identity;
use crate::log::DiscussionLog;
use crate::log::DiscussionSummary;
use crate::prompt::build_prompt;
use crate::turn::TurnCandidate;
use crate::turn::decide_turn;
use crate::util::retry_backoff;

pub struct AgentRuntime {
    config: Config,
    log: DiscussionLog,
    running: AtomicBool,
    state: Mutex<RuntimeState>,
}

#[derive(Default)]
struct RuntimeState {
    /// Last observed seq per watched discussion.
    watched: HashMap<String, u64>,
    last_watched_at: HashMap<String, Instant>,
    timers: HashMap<String, AbortHandle>,
    scan_timer: Option<AbortHandle>,
    cleanup_timer: Option<AbortHandle>,

    /// Mutual-exclusion token per discussion: held while a response
    /// attempt is in flight.
    responding: HashSet<String>,
    /// Rounds already attempted this process lifetime, per discussion.
    attempted_rounds: HashMap<String, HashSet<u32>>,
    /// Timeout retry attempts per discussion.
    retries: HashMap<String, u32>,
    /// Consecutive failures per discussion, feeding the circuit breaker.
    failures: HashMap<String, u32>,
    circuit_open_until: HashMap<String, Instant>,

    active_count: usize,
    pending_queue: VecDeque<PendingTurn>,
    /// Re-entry guard for the queue drain loop.
    draining: bool,
}

#[derive(Debug, Clone)]
struct PendingTurn {
    id: String,
    round: u32,
    enqueued_at: Instant,
}

enum Admission {
    Granted,
    Rejected { rejection: Rejection, drain: bool },
}

impl RuntimeState {
    /// Steps 1-6 of turn admission. Runs entirely under the state lock.
    fn admit(&mut self, id: &str, round: u32, config: &Config) -> Admission {
        let now = Instant::now();
        if let Some(until) = self.circuit_open_until.get(id) {
            if *until > now {
                return Admission::Rejected {
                    rejection: Rejection::CircuitOpen,
                    drain: false,
                };
            }
            // Cooldown elapsed: close the circuit and start fresh.
            self.circuit_open_until.remove(id);
            self.failures.remove(id);
        }

        if self.active_count >= config.max_concurrent {
            if self.pending_queue.iter().any(|p| p.id == id) {
                return Admission::Rejected {
                    rejection: Rejection::Queued,
                    drain: false,
                };
            }
            if self.pending_queue.len() >= config.max_queue_size
                && let Some(evicted) = self.pending_queue.pop_front()
            {
                warn!(
                    id = %evicted.id,
                    round = evicted.round,
                    waited_ms = evicted.enqueued_at.elapsed().as_millis() as u64,
                    "pending queue full, evicting oldest entry"
                );
            }
            self.pending_queue.push_back(PendingTurn {
                id: id.to_string(),
                round,
                enqueued_at: now,
            });
            return Admission::Rejected {
                rejection: Rejection::Queued,
                drain: false,
            };
        }

        self.active_count += 1;

        if self.responding.contains(id) {
            self.active_count -= 1;
            return Admission::Rejected {
                rejection: Rejection::AlreadyResponding,
                drain: true,
            };
        }
        if self
            .attempted_rounds
            .get(id)
            .is_some_and(|rounds| rounds.contains(&round))
        {
            self.active_count -= 1;
            return Admission::Rejected {
                rejection: Rejection::AlreadyAttempted,
                drain: true,
            };
        }

        self.responding.insert(id.to_string());
        self.attempted_rounds
            .entry(id.to_string())
            .or_default()
            .insert(round);
        Admission::Granted
    }

    fn finalize(&mut self, id: &str, success: bool, config: &Config) {
        self.responding.remove(id);
        self.active_count = self.active_count.saturating_sub(1);
        if success {
            self.failures.remove(id);
            self.circuit_open_until.remove(id);
            self.retries.remove(id);
        } else {
            let failures = self.failures.entry(id.to_string()).or_insert(0);
            *failures += 1;
            if *failures >= config.circuit_threshold {
                warn!(
                    %id,
                    failures = *failures,
                    cooldown_ms = config.circuit_cooldown.as_millis() as u64,
                    "opening local circuit"
                );
                self.circuit_open_until
                    .insert(id.to_string(), Instant::now() + config.circuit_cooldown);
            }
        }
    }

    /// Drop every table entry for a discussion. The watcher abort handle
    /// is returned so the caller can cancel it outside the lock.
    fn release_discussion(&mut self, id: &str) -> Option<AbortHandle> {
        self.watched.remove(id);
        self.last_watched_at.remove(id);
        self.responding.remove(id);
        self.attempted_rounds.remove(id);
        self.retries.remove(id);
        self.failures.remove(id);
        self.circuit_open_until.remove(id);
        self.pending_queue.retain(|p| p.id != id);
        self.timers.remove(id)
    }
}

impl AgentRuntime {
    pub fn new(config: Config) -> Self {
        let log =
            DiscussionLog::with_lock_settings(config.base_dir.clone(), config.lock_settings.clone());
        Self {
            config,
            log,
            running: AtomicBool::new(false),
            state: Mutex::new(RuntimeState::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn log(&self) -> &DiscussionLog {
        &self.log
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Discussions currently holding a watcher timer.
    pub fn watched_discussions(&self) -> Vec<String> {
        self.state.lock().unwrap().timers.keys().cloned().collect()
    }

    /// In-flight response attempts.
    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active_count
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().unwrap().pending_queue.len()
    }

    /// Start watching: enumerate discussions, register watcher timers for
    /// the prioritized subset, and kick off the scan and cleanup sweeps.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.base_dir).await?;
        self.running.store(true, Ordering::SeqCst);
        info!(
            agent = %self.config.agent_name,
            base_dir = %self.config.base_dir.display(),
            "agent runtime starting"
        );

        self.scan().await;

        let scan_handle = {
            let runtime = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(runtime.config.scan_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                while runtime.is_running() {
                    ticker.tick().await;
                    runtime.scan().await;
                }
            })
            .abort_handle()
        };
        let cleanup_handle = {
            let runtime = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(runtime.config.cleanup_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                while runtime.is_running() {
                    ticker.tick().await;
                    runtime.sweep().await;
                }
            })
            .abort_handle()
        };

        let mut state = self.state.lock().unwrap();
        state.scan_timer = Some(scan_handle);
        state.cleanup_timer = Some(cleanup_handle);
        Ok(())
    }

    /// Stop watching: clears every timer and the pending queue. In-flight
    /// child processes are left to settle on their own timeouts.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        for (_, handle) in state.timers.drain() {
            handle.abort();
        }
        if let Some(handle) = state.scan_timer.take() {
            handle.abort();
        }
        if let Some(handle) = state.cleanup_timer.take() {
            handle.abort();
        }
        state.pending_queue.clear();
        info!(agent = %self.config.agent_name, "agent runtime stopped");
    }

    /// Re-run prioritization: watch the top discussions, release watchers
    /// for any that dropped out and are not mid-response.
    async fn scan(self: &Arc<Self>) {
        let summaries = match self.log.list().await {
            Ok(summaries) => summaries,
            Err(err) => {
                warn!(%err, "discussion scan failed");
                return;
            }
        };

        let keep = self.prioritize(summaries);
        let keep_ids: HashSet<&String> = keep.iter().collect();

        let (to_add, to_release) = {
            let state = self.state.lock().unwrap();
            let to_add: Vec<String> = keep
                .iter()
                .filter(|id| !state.timers.contains_key(*id))
                .map(|id| (*id).clone())
                .collect();
            let to_release: Vec<String> = state
                .timers
                .keys()
                .filter(|id| !keep_ids.contains(id) && !state.responding.contains(*id))
                .cloned()
                .collect();
            (to_add, to_release)
        };

        for id in to_release {
            debug!(%id, "releasing watcher after reprioritization");
            let mut state = self.state.lock().unwrap();
            if let Some(handle) = state.timers.remove(&id) {
                handle.abort();
            }
            state.watched.remove(&id);
            state.last_watched_at.remove(&id);
        }
        for id in to_add {
            self.watch_discussion(id);
        }
    }

    /// Most recent activity first; ties broken towards the discussion we
    /// have not polled for the longest, so nothing starves.
    fn prioritize(&self, mut summaries: Vec<DiscussionSummary>) -> Vec<String> {
        summaries.retain(|s| !s.status.ended && s.status.is_participant(&self.config.agent_name));
        let last_watched = {
            let state = self.state.lock().unwrap();
            state.last_watched_at.clone()
        };
        summaries.sort_by(|a, b| {
            b.last_activity.cmp(&a.last_activity).then_with(|| {
                let a_watched = last_watched.get(&a.id);
                let b_watched = last_watched.get(&b.id);
                // `None` means never polled, which sorts first.
                match (a_watched, b_watched) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (Some(a), Some(b)) => a.cmp(b),
                }
            })
        });
        summaries.truncate(self.config.max_watched_discussions);
        summaries.into_iter().map(|s| s.id).collect()
    }

    fn watch_discussion(self: &Arc<Self>, id: String) {
        let runtime = Arc::clone(self);
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runtime.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while runtime.is_running() {
                ticker.tick().await;
                runtime.poll_discussion(&timer_id).await;
            }
        })
        .abort_handle();

        debug!(%id, "watching discussion");
        let mut state = self.state.lock().unwrap();
        if let Some(previous) = state.timers.insert(id, handle) {
            previous.abort();
        }
    }

    async fn poll_discussion(self: &Arc<Self>, id: &str) {
        let messages = match self.log.read_all(id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(%id, %err, "poll failed");
                return;
            }
        };
        if messages.is_empty() {
            // Log file deleted out from under us.
            self.cleanup(id);
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            let last_seq = messages.last().map(|m| m.seq).unwrap_or(0);
            state.watched.insert(id.to_string(), last_seq);
            state
                .last_watched_at
                .insert(id.to_string(), Instant::now());
        }

        if messages.iter().any(|m| m.is_end()) {
            debug!(%id, "discussion ended, releasing watcher");
            self.cleanup(id);
            return;
        }

        let Some(candidate) = decide_turn(&self.config.agent_name, &messages, self.config.max_rounds)
        else {
            return;
        };
        self.try_respond(id, candidate).await;
    }

    async fn try_respond(self: &Arc<Self>, id: &str, candidate: TurnCandidate) {
        let admission = {
            let mut state = self.state.lock().unwrap();
            state.admit(id, candidate.round, &self.config)
        };
        match admission {
            Admission::Granted => {
                debug!(%id, round = candidate.round, trigger = ?candidate.trigger, "turn admitted");
                let runtime = Arc::clone(self);
                let id = id.to_string();
                tokio::spawn(async move {
                    runtime.execute_response(&id, candidate.round, true).await;
                });
            }
            Admission::Rejected { rejection, drain } => {
                debug!(%id, round = candidate.round, %rejection, "turn rejected");
                if drain {
                    self.drain().await;
                }
            }
        }
    }

    /// One full response attempt. The responding lock and the
    /// attempted-round entry are already held via admission.
    /// `first_attempt` is false when a timeout retry re-enters: the retry
    /// announced itself with a `retrying` status, so the turn must not
    /// emit a second `thinking` record.
    async fn execute_response(self: &Arc<Self>, id: &str, round: u32, first_attempt: bool) {
        if first_attempt {
            let thinking = Message::status(
                &self.config.agent_name,
                Some(round),
                StatusKind::Thinking,
                "reading the discussion",
            );
            if let Err(err) = self.log.append(id, thinking).await {
                // Best-effort: a missed status record never aborts the turn.
                warn!(%id, %err, "failed to append thinking status");
            }
        }

        let (status, messages) = match self.load_for_prompt(id).await {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(%id, %err, "could not load discussion for prompt");
                self.clear_attempted_round(id, round);
                self.finalize(id, false).await;
                return;
            }
        };
        if status.ended {
            self.finalize(id, true).await;
            return;
        }

        let prompt = build_prompt(&self.config.agent_name, &status, &messages, round);
        let workdir = status
            .context
            .get(roundtable_protocol::WORKING_DIR_KEY)
            .map(Into::into)
            .unwrap_or_else(|| self.config.default_workdir.clone());

        let request = InvokeRequest {
            binary: self.config.binary.clone(),
            args: self.config.agent_args.clone(),
            prompt,
            cwd: workdir,
            env: self.config.env.clone(),
            timeout: self.config.invoke_timeout,
        };

        match exec::invoke(request.clone()).await {
            Ok(output) => {
                self.handle_output(id, round, &status, output, request).await;
            }
            Err(err) if err.is_timeout() => {
                self.finalize(id, false).await;
                self.retry_after_timeout(id, round).await;
            }
            Err(err) => {
                warn!(%id, round, %err, "invocation failed");
                self.append_error(id, round, &err.to_string()).await;
                self.finalize(id, false).await;
            }
        }
    }

    /// Validate, parse, and append the response. An identity failure gets
    /// a single in-place retry, not the timeout backoff chain.
    async fn handle_output(
        self: &Arc<Self>,
        id: &str,
        round: u32,
        status: &DiscussionStatus,
        output: String,
        request: InvokeRequest,
    ) {
        let agent = &self.config.agent_name;
        let body = match identity::validate_identity(&output, agent, &status.participants) {
            Ok(body) => Some(body),
            Err(first_err) => {
                debug!(%id, %first_err, "identity check failed, retrying once");
                let retrying = Message::status(
                    agent,
                    Some(round),
                    StatusKind::Retrying,
                    format!("identity check failed ({first_err}), retrying"),
                );
                if let Err(err) = self.log.append(id, retrying).await {
                    warn!(%id, %err, "failed to append retrying status");
                }
                match exec::invoke(request).await {
                    Ok(output) => {
                        match identity::validate_identity(&output, agent, &status.participants) {
                            Ok(body) => Some(body),
                            Err(err) => {
                                self.append_error(
                                    id,
                                    round,
                                    &format!("invalid agent output: {err}"),
                                )
                                .await;
                                None
                            }
                        }
                    }
                    Err(err) => {
                        self.append_error(id, round, &err.to_string()).await;
                        None
                    }
                }
            }
        };
        let Some(body) = body else {
            self.finalize(id, false).await;
            return;
        };

        let opinion = identity::parse_opinion(&body);
        let confidence = identity::parse_confidence(&body);
        let counterparts: Vec<String> = status
            .participants
            .iter()
            .filter(|p| !p.eq_ignore_ascii_case(agent))
            .cloned()
            .collect();
        let content = identity::apply_consensus_closure(body, opinion, &counterparts);

        let response = Message::response(agent, round, opinion, content, confidence);
        match self.log.append(id, response).await {
            Ok(stamped) => {
                info!(%id, round, seq = stamped.seq, ?opinion, "response appended");
                self.finalize(id, true).await;
            }
            Err(err) => {
                // Lock contention is retryable: free the round so the next
                // poll can offer it again.
                warn!(%id, round, %err, "failed to append response");
                self.clear_attempted_round(id, round);
                self.finalize(id, false).await;
            }
        }
    }

    /// Timeout retry: up to `max_retries` attempts per discussion, with
    /// 30s/60s/120s waits, re-entering admission each time.
    fn retry_after_timeout<'a>(
        self: &'a Arc<Self>,
        id: &'a str,
        round: u32,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let attempt = {
            let mut state = self.state.lock().unwrap();
            let attempt = state.retries.entry(id.to_string()).or_insert(0);
            *attempt += 1;
            *attempt
        };
        if attempt > self.config.max_retries {
            warn!(%id, round, attempt, "timeout retries exhausted");
            self.append_error(
                id,
                round,
                &format!("timed out after {} attempts", self.config.max_retries),
            )
            .await;
            self.state.lock().unwrap().retries.remove(id);
            return;
        }

        let wait = retry_backoff(attempt, self.config.retry_base_delay);
        info!(%id, round, attempt, wait_ms = wait.as_millis() as u64, "retrying after timeout");
        tokio::time::sleep(wait).await;
        if !self.is_running() {
            return;
        }

        // The round stays in attempted_rounds for the whole wait so the
        // pollers cannot open a second turn (and a second `thinking`
        // record) for it.
        let retrying = Message::status(
            &self.config.agent_name,
            Some(round),
            StatusKind::Retrying,
            format!("{attempt}/{}", self.config.max_retries),
        );
        if let Err(err) = self.log.append(id, retrying).await {
            warn!(%id, %err, "failed to append retrying status");
        }

        // Free the round and re-enter admission under one lock, leaving
        // no window for a poll to claim the round as a fresh turn.
        let admission = {
            let mut state = self.state.lock().unwrap();
            if let Some(rounds) = state.attempted_rounds.get_mut(id) {
                rounds.remove(&round);
            }
            state.admit(id, round, &self.config)
        };
        match admission {
            Admission::Granted => {
                debug!(%id, round, attempt, "timeout retry readmitted");
                let runtime = Arc::clone(self);
                let id = id.to_string();
                tokio::spawn(async move {
                    runtime.execute_response(&id, round, false).await;
                });
            }
            Admission::Rejected { rejection, drain } => {
                debug!(%id, round, %rejection, "timeout retry rejected");
                if drain {
                    self.drain().await;
                }
            }
        }
        })
    }

    async fn load_for_prompt(&self, id: &str) -> Result<(DiscussionStatus, Vec<Message>)> {
        let messages = self.log.read_all(id).await?;
        let status = DiscussionStatus::derive(id, &messages)
            .ok_or_else(|| RoundtableErr::MissingStart(id.to_string()))?;
        Ok((status, messages))
    }

    async fn append_error(self: &Arc<Self>, id: &str, round: u32, error: &str) {
        let record = Message::error(&self.config.agent_name, Some(round), error);
        if let Err(err) = self.log.append(id, record).await {
            warn!(%id, %err, "failed to append error record");
        }
    }

    fn clear_attempted_round(&self, id: &str, round: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(rounds) = state.attempted_rounds.get_mut(id) {
            rounds.remove(&round);
        }
    }

    async fn finalize(self: &Arc<Self>, id: &str, success: bool) {
        {
            let mut state = self.state.lock().unwrap();
            state.finalize(id, success, &self.config);
        }
        self.drain().await;
    }

    /// Re-offer queued turns while slots are free. Guarded against
    /// re-entry: a drain triggered from within a drain returns
    /// immediately.
    fn drain<'a>(self: &'a Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        {
            let mut state = self.state.lock().unwrap();
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let item = {
                let mut state = self.state.lock().unwrap();
                if state.active_count >= self.config.max_concurrent {
                    None
                } else {
                    state.pending_queue.pop_front()
                }
            };
            let Some(item) = item else {
                break;
            };

            // The queue entry may be stale; re-derive the turn.
            let messages = match self.log.read_all(&item.id).await {
                Ok(messages) => messages,
                Err(err) => {
                    warn!(id = %item.id, %err, "dropping queued turn, read failed");
                    continue;
                }
            };
            let Some(candidate) =
                decide_turn(&self.config.agent_name, &messages, self.config.max_rounds)
            else {
                debug!(id = %item.id, "queued turn no longer applies");
                continue;
            };

            let admission = {
                let mut state = self.state.lock().unwrap();
                state.admit(&item.id, candidate.round, &self.config)
            };
            match admission {
                Admission::Granted => {
                    let runtime = Arc::clone(self);
                    let id = item.id.clone();
                    tokio::spawn(async move {
                        runtime.execute_response(&id, candidate.round, true).await;
                    });
                }
                Admission::Rejected { rejection, .. } => {
                    debug!(id = %item.id, %rejection, "queued turn rejected on drain");
                }
            }
        }

        self.state.lock().unwrap().draining = false;
        })
    }

    /// Sweep for discussions that ended or disappeared while we were not
    /// looking at them.
    async fn sweep(self: &Arc<Self>) {
        let watched: Vec<String> = {
            let state = self.state.lock().unwrap();
            state.timers.keys().cloned().collect()
        };
        for id in watched {
            match self.log.status(&id).await {
                Ok(Some(status)) if !status.ended => {}
                Ok(_) => self.cleanup(&id),
                Err(err) => {
                    warn!(%id, %err, "status check failed during cleanup sweep");
                }
            }
        }
    }

    /// Release the watcher and every table entry for a discussion.
    fn cleanup(&self, id: &str) {
        let handle = {
            let mut state = self.state.lock().unwrap();
            state.release_discussion(id)
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
