use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Wall-clock milliseconds that advance with the tokio clock.
///
/// Heartbeats written to the flag store are compared across tabs, so they need
/// epoch time; deriving it from a tokio `Instant` keeps it consistent with the
/// timers, including when time is paused.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base_ms: u64,
    started: Instant,
}

impl Clock {
    #[must_use]
    pub fn system() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        Self::starting_at(base_ms)
    }

    #[must_use]
    pub fn starting_at(base_ms: u64) -> Self {
        Self {
            base_ms,
            started: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.base_ms
            .saturating_add(self.started.elapsed().as_millis() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_time() {
        let clock = Clock::starting_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.now_ms(), 1_250);
    }
}
