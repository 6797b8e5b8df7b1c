//! Knobs for one agent daemon. Everything has a sensible default; the
//! daemon driver overrides what its flags cover.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::exec::scrubbed_env;
use crate::flags::ROUNDTABLE_BASE_DIR;
use crate::flags::ROUNDTABLE_INVOKE_TIMEOUT_MS;
use crate::lockfile::LockSettings;

#[derive(Debug, Clone)]
pub struct Config {
    /// This agent's name as it appears in `participants` and `from`.
    pub agent_name: String,
    /// External CLI to invoke for responses.
    pub binary: PathBuf,
    /// Preset arguments; the prompt is appended as the final argument.
    pub agent_args: Vec<String>,
    /// Environment handed to the CLI (scrubbed by default).
    pub env: HashMap<String, String>,

    /// Directory holding `<id>.jsonl` logs.
    pub base_dir: PathBuf,
    /// Working directory for invocations when the discussion context does
    /// not carry one.
    pub default_workdir: PathBuf,
    pub lock_settings: LockSettings,

    /// Per-discussion watcher period.
    pub poll_interval: Duration,
    /// Re-prioritization period is `poll_interval * 2`; this cap bounds how
    /// many discussions get watchers at once.
    pub max_watched_discussions: usize,
    /// Sweep period for ended or deleted discussions.
    pub cleanup_interval: Duration,

    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub max_rounds: u32,

    pub invoke_timeout: Duration,
    /// Attempts per discussion for the timeout retry path.
    pub max_retries: u32,
    /// First wait of the timeout retry schedule; doubles per attempt and
    /// caps at four times this value.
    pub retry_base_delay: Duration,

    /// Consecutive failures before the local circuit opens.
    pub circuit_threshold: u32,
    pub circuit_cooldown: Duration,
}

/// Default log directory: `ROUNDTABLE_BASE_DIR`, resolved against the
/// current working directory when relative.
pub fn default_base_dir() -> std::io::Result<PathBuf> {
    let base = PathBuf::from(*ROUNDTABLE_BASE_DIR);
    if base.is_absolute() {
        Ok(base)
    } else {
        Ok(std::env::current_dir()?.join(base))
    }
}

impl Config {
    /// Defaults plus environment overrides.
    pub fn new(agent_name: impl Into<String>, binary: impl Into<PathBuf>) -> std::io::Result<Self> {
        let cwd = std::env::current_dir()?;
        let base_dir = default_base_dir()?;

        Ok(Self {
            agent_name: agent_name.into(),
            binary: binary.into(),
            agent_args: Vec::new(),
            env: scrubbed_env(),
            base_dir,
            default_workdir: cwd,
            lock_settings: LockSettings::default(),
            poll_interval: Duration::from_secs(2),
            max_watched_discussions: 50,
            cleanup_interval: Duration::from_secs(60),
            max_concurrent: 5,
            max_queue_size: 20,
            max_rounds: 5,
            invoke_timeout: *ROUNDTABLE_INVOKE_TIMEOUT_MS,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(30),
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
        })
    }

    pub fn scan_interval(&self) -> Duration {
        self.poll_interval * 2
    }
}
