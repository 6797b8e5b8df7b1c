//! Root of the `roundtable-core` library.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod agents;
mod codec;
pub mod config;
pub mod error;
pub mod exec;
pub mod identity;
mod lockfile;
pub mod log;
mod prompt;
pub mod runtime;
pub mod turn;
pub mod util;

mod flags;

pub use config::Config;
pub use error::Rejection;
pub use error::Result;
pub use error::RoundtableErr;
pub use lockfile::LockSettings;
pub use log::DiscussionLog;
pub use log::DiscussionSummary;
pub use log::WatchHandle;
pub use runtime::AgentRuntime;
