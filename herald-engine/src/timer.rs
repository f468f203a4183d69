//! Election timer jitter and the deadlines polled by the node loop.

use herald_core::ElectionConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::pending;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Draws election timer delays.
///
/// Every reset picks a fresh delay uniformly from `[base, 2 * base)`. Nodes
/// that lose their leader at the same moment therefore time out at different
/// moments, and one of them usually collects its votes before the others
/// start campaigning.
#[derive(Debug)]
pub struct ElectionTimer {
    rng: StdRng,
    election_timeout: Duration,
    heartbeat_timeout: Duration,
}

impl ElectionTimer {
    pub fn new(config: &ElectionConfig) -> Self {
        let rng = match config.randomization_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            election_timeout: config.election_timeout,
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }

    /// Full election window: `[election_timeout, 2 * election_timeout)`.
    pub fn randomized(&mut self) -> Duration {
        jitter(&mut self.rng, self.election_timeout)
    }

    /// Shortened window used after a leader resigns:
    /// `[heartbeat_timeout, 2 * heartbeat_timeout)`.
    pub fn short(&mut self) -> Duration {
        jitter(&mut self.rng, self.heartbeat_timeout)
    }
}

fn jitter(rng: &mut StdRng, base: Duration) -> Duration {
    let base_nanos = base.as_nanos().min(u64::MAX as u128 / 2) as u64;
    if base_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rng.gen_range(base_nanos..base_nanos * 2))
}

/// Deadlines for the three timer classes of a node. `None` means disarmed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timers {
    pub election: Option<Instant>,
    pub heartbeat: Option<Instant>,
    pub quorum_watchdog: Option<Instant>,
}

impl Timers {
    pub fn disarm_all(&mut self) {
        *self = Self::default();
    }
}

/// Sleeps until `deadline`, or forever when the timer is disarmed.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}
