use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Source of time for compaction.
///
/// Window bounds come from [`now`](Clock::now); the cycle timer and the
/// throttle pause wait through [`sleep`](Clock::sleep).
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time and tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
