use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::registry::ConnectionRegistry;

/// How often every connection is probed.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// How long a probe waits for its acknowledgment.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-connection probe state machine driven by the socket writer loop.
///
/// ALIVE -> (probe sent) -> AWAITING_PONG -> ALIVE on acknowledgment, or
/// AWAITING_PONG -> DEAD when the deadline passes unacknowledged. Probe and
/// timeout cancel each other: an acknowledged probe disarms its deadline,
/// an expired deadline terminates the connection.
#[derive(Debug)]
pub struct ProbeTimer {
    pong_timeout: Duration,
    awaiting_since: Option<Instant>,
}

/// What an expired probe deadline means for the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Acknowledged,
    TimedOut,
}

impl ProbeTimer {
    pub fn new(pong_timeout: Duration) -> Self {
        Self {
            pong_timeout,
            awaiting_since: None,
        }
    }

    /// Arm the deadline for a probe just written to the transport.
    pub fn probe_sent(&mut self, at: Instant) {
        self.awaiting_since = Some(at);
    }

    /// The pending probe's deadline, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.awaiting_since.map(|since| since + self.pong_timeout)
    }

    /// Resolve the pending probe against the last acknowledgment seen on the
    /// reader side. Disarms the deadline either way; a timed-out probe means
    /// the connection must be terminated.
    pub fn resolve(&mut self, last_pong: Option<Instant>) -> ProbeOutcome {
        let outcome = match (self.awaiting_since, last_pong) {
            (Some(since), Some(pong)) if pong >= since => ProbeOutcome::Acknowledged,
            (Some(_), _) => ProbeOutcome::TimedOut,
            // No probe pending: nothing to time out.
            (None, _) => ProbeOutcome::Acknowledged,
        };
        self.awaiting_since = None;
        outcome
    }
}

/// Background reaper: prunes registry entries whose sockets died without a
/// clean close (the per-socket probe normally wins the race).
pub fn start_reaper(
    registry: Arc<ConnectionRegistry>,
    probe_interval: Duration,
    pong_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let cutoff = probe_interval + pong_timeout;
        let mut ticker = tokio::time::interval(probe_interval);
        ticker.tick().await; // consume first immediate tick
        loop {
            ticker.tick().await;
            let removed = registry.prune_dead(cutoff);
            if removed > 0 {
                tracing::info!(removed = removed, "liveness reaper pruned connections");
            }
        }
    })
}
