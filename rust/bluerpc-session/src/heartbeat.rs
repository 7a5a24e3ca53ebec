use std::time::Duration;

use tokio::time::Instant;

/// What to do when the heartbeat deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Beat {
    /// Send a ping whose one-byte payload is the number of tries left.
    Ping(u8),
    /// Every try went unanswered.
    Failed,
}

/// Liveness countdown.
///
/// Any inbound ping, pong, or message resets it. Each interval that passes
/// in silence costs one try; running out means the peer is gone.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    interval: Duration,
    tries: u32,
    missed: u32,
    deadline: Instant,
}

impl Heartbeat {
    pub(crate) fn new(interval: Duration, tries: u32) -> Self {
        Self {
            interval,
            tries,
            missed: 0,
            deadline: Instant::now() + interval,
        }
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn reset(&mut self) {
        self.missed = 0;
        self.deadline = Instant::now() + self.interval;
    }

    pub(crate) fn expired(&mut self) -> Beat {
        self.missed += 1;
        if self.missed > self.tries {
            return Beat::Failed;
        }
        self.deadline = Instant::now() + self.interval;
        let left = self.tries - self.missed;
        Beat::Ping(u8::try_from(left).unwrap_or(u8::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn counts_down_then_fails() {
        let mut heartbeat = Heartbeat::new(Duration::from_secs(5), 3);
        assert_eq!(heartbeat.expired(), Beat::Ping(2));
        assert_eq!(heartbeat.expired(), Beat::Ping(1));
        assert_eq!(heartbeat.expired(), Beat::Ping(0));
        assert_eq!(heartbeat.expired(), Beat::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_restores_every_try() {
        let mut heartbeat = Heartbeat::new(Duration::from_secs(5), 3);
        heartbeat.expired();
        heartbeat.expired();
        tokio::time::advance(Duration::from_secs(2)).await;
        heartbeat.reset();
        assert_eq!(heartbeat.deadline(), Instant::now() + Duration::from_secs(5));
        assert_eq!(heartbeat.expired(), Beat::Ping(2));
    }
}
