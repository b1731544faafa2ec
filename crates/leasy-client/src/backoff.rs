use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with jitter for the reconnect loop.
///
/// Delays double from `base` up to `cap`, each with up to 20% uniform jitter
/// on top so reconnecting clients spread out after a server restart instead
/// of stampeding it at a fixed interval.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = exp.as_millis() as u64 / 5;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        exp + jitter
    }

    /// Call after a successful connection so the next failure starts small.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(5);
    const CAP: Duration = Duration::from_secs(60);

    fn within_jitter(delay: Duration, exp: Duration) -> bool {
        delay >= exp && delay <= exp + exp / 5
    }

    #[test]
    fn first_delay_starts_at_base() {
        let mut backoff = Backoff::new(BASE, CAP);
        let delay = backoff.next_delay();
        assert!(within_jitter(delay, BASE), "got {delay:?}");
    }

    #[test]
    fn delays_double_until_cap() {
        let mut backoff = Backoff::new(BASE, CAP);
        let expected = [5u64, 10, 20, 40, 60, 60, 60];
        for secs in expected {
            let delay = backoff.next_delay();
            assert!(
                within_jitter(delay, Duration::from_secs(secs)),
                "expected ~{secs}s, got {delay:?}"
            );
        }
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::new(BASE, CAP);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(within_jitter(delay, BASE), "got {delay:?}");
    }

    #[test]
    fn attempt_counter_tracks_failures() {
        let mut backoff = Backoff::new(BASE, CAP);
        assert_eq!(backoff.attempt(), 0);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
    }
}
