use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Base directory for discussion logs. Relative paths are resolved
    /// against the process's current working directory.
    pub ROUNDTABLE_BASE_DIR: &str = "discussions";

    /// Overrides for the two built-in agent CLIs. When unset the binary is
    /// looked up by name on PATH.
    pub CLAUDE_BIN: Option<&str> = None;
    pub CODEX_BIN: Option<&str> = None;

    /// Wall-clock budget for a single child-process invocation.
    pub ROUNDTABLE_INVOKE_TIMEOUT_MS: Duration = Duration::from_millis(180_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}
