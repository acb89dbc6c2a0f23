//! Per-IP rate limiting
//!
//! Two keyed token buckets per source address, one per-minute and one
//! per-hour; exceeding either refuses the request with a `Retry-After`
//! hint. Buckets live in process memory (keyed `DashMap` store) and a
//! background sweeper drops idle ones.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter as GovernorLimiter};
use tracing::debug;

type KeyedLimiter = GovernorLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// Per-IP dual-window rate limiter.
pub struct IpRateLimiter {
    minute: KeyedLimiter,
    hour: KeyedLimiter,
    clock: DefaultClock,
}

impl IpRateLimiter {
    /// Create with the configured per-minute and per-hour budgets.
    #[must_use]
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        let per_minute = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
        let per_hour = NonZeroU32::new(per_hour).unwrap_or(NonZeroU32::MIN);
        Self {
            minute: GovernorLimiter::keyed(Quota::per_minute(per_minute)),
            hour: GovernorLimiter::keyed(Quota::per_hour(per_hour)),
            clock: DefaultClock::default(),
        }
    }

    /// Try to admit one request from `ip`.
    ///
    /// The minute bucket is consulted first and a refusal short-circuits:
    /// a request the minute window already rejects must not consume an
    /// hour-window token, or bursting past the minute limit would drain
    /// the hour budget with nothing but denied requests.
    ///
    /// # Errors
    ///
    /// The suggested `Retry-After` delay in whole seconds (at least 1)
    /// when either bucket is exhausted.
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let now = self.clock.now();
        if let Err(not_until) = self.minute.check_key(&ip) {
            return Err(not_until.wait_time_from(now).as_secs().max(1));
        }
        if let Err(not_until) = self.hour.check_key(&ip) {
            return Err(not_until.wait_time_from(now).as_secs().max(1));
        }
        Ok(())
    }

    /// Drop buckets that have been idle long enough to be full again.
    pub fn sweep(&self) {
        self.minute.retain_recent();
        self.hour.retain_recent();
    }

    /// Number of tracked addresses (minute window).
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.minute.len()
    }
}

/// Spawn a background task that sweeps idle buckets every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_sweeper(
    limiter: Arc<IpRateLimiter>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    limiter.sweep();
                    debug!(tracked = limiter.tracked(), "Swept rate-limit buckets");
                }
                _ = shutdown.recv() => {
                    debug!("Rate-limit sweeper shutting down");
                    break;
                }
            }
        }
    });
}
