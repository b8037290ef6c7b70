//! Time source for convergence polling

use std::time::Duration;
use tokio::time::Instant;

/// Clock used by the convergence poller
///
/// Production code uses [`SystemClock`]; tests substitute a clock that
/// reports arbitrary elapsed time without sleeping.
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;

    /// Suspend for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
