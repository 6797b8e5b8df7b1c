use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;

/// Make a notifier that is fulfilled when SIGINT occurs.
pub fn notify_on_sigint() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());

    tokio::spawn({
        let notify = Arc::clone(&notify);
        async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                debug!("Keyboard interrupt");
                notify.notify_waiters();
            }
        }
    });

    notify
}

/// Backoff schedule for re-invoking a timed-out child, 1-indexed and
/// doubling per attempt, capped at four times the base (30s, 60s, 120s,
/// 120s with the default base).
pub(crate) fn retry_backoff(attempt: u32, base: Duration) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(8);
    base.saturating_mul(factor.min(4))
}

/// Collision-resistant short discussion id: 8 hex chars.
pub(crate) fn generate_discussion_id() -> String {
    format!("{:08x}", rand::rng().random::<u32>())
}
