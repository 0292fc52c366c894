//! Polling schedules, deadlines and per-call timeouts.
//!
//! Every facade call can suspend indefinitely, so each one runs under a
//! timeout derived from the enclosing budget. Status polls are paced so two
//! checks of the same resource are never closer than [`MIN_POLL_INTERVAL`].

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tracing::debug;

use crate::config::{DriveConfig, MIN_POLL_INTERVAL};
use crate::error::ClientError;

/// Exponential backoff clamped to `[MIN_POLL_INTERVAL, max]`
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    factor: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: u32) -> Self {
        let current = initial.max(MIN_POLL_INTERVAL);
        Self {
            current,
            max: max.max(current),
            factor: factor.max(1),
        }
    }

    pub fn from_config(config: &DriveConfig) -> Self {
        Self::new(
            config.poll_interval(),
            config.max_poll_interval(),
            config.poll_backoff_factor,
        )
    }

    /// Delay to wait now; the following delay grows by the factor
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(self.factor)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }
}

/// A fixed point in time after which a phase gives up
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn at(&self) -> Instant {
        self.started + self.budget
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.at().saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at()
    }
}

/// Paces status checks of one resource within a deadline
#[derive(Debug)]
pub struct Poller {
    backoff: Backoff,
    deadline: Deadline,
    last_check: Option<Instant>,
    checks: u32,
}

impl Poller {
    pub fn new(backoff: Backoff, deadline: Deadline) -> Self {
        Self {
            backoff,
            deadline,
            last_check: None,
            checks: 0,
        }
    }

    /// Wait until the next status check is due.
    ///
    /// The first check is due immediately. Returns `false` without waiting
    /// when the next check would fall after the deadline.
    pub async fn tick(&mut self) -> bool {
        if let Some(last) = self.last_check {
            let due = last + self.backoff.next_delay();
            if due > self.deadline.at() {
                return false;
            }
            sleep_until(due).await;
        } else if self.deadline.expired() {
            return false;
        }
        self.last_check = Some(Instant::now());
        self.checks += 1;
        true
    }

    /// Status checks issued so far
    pub fn checks(&self) -> u32 {
        self.checks
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Timeout for one call issued from this polling loop
    pub fn call_timeout(&self, request_timeout: Duration) -> Duration {
        request_timeout.min(self.deadline.remaining()).max(MIN_POLL_INTERVAL)
    }
}

/// Run `fut` under `limit`, reporting expiry as a transport failure
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Transport(format!(
            "request timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Issue a single call, repeating it on transient failures until the call
/// budget runs out
pub async fn retry_transient<T, F, Fut>(
    config: &DriveConfig,
    what: &str,
    mut op: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let deadline = Deadline::after(config.call_budget());
    let mut backoff = Backoff::from_config(config);
    let mut attempt = 1u32;

    loop {
        let limit = config.request_timeout().min(deadline.remaining());
        match bounded(limit, op()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                let delay = backoff.next_delay();
                if delay >= deadline.remaining() {
                    return Err(err);
                }
                debug!(
                    request = what,
                    attempt = attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient ACME failure, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10), 2);
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_backoff_factor_one_is_fixed() {
        let mut backoff = Backoff::new(Duration::from_secs(3), Duration::from_secs(30), 1);
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
    }

    proptest! {
        #[test]
        fn backoff_never_below_floor_or_above_cap(
            initial_ms in 0u64..5_000,
            max_ms in 0u64..60_000,
            factor in 0u32..5,
            steps in 1usize..20,
        ) {
            let mut backoff = Backoff::new(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                factor,
            );
            let cap = Duration::from_millis(max_ms)
                .max(Duration::from_millis(initial_ms))
                .max(MIN_POLL_INTERVAL);
            for _ in 0..steps {
                let delay = backoff.next_delay();
                prop_assert!(delay >= MIN_POLL_INTERVAL);
                prop_assert!(delay <= cap);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_spacing_and_deadline() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(4), 2);
        let mut poller = Poller::new(backoff, Deadline::after(Duration::from_secs(10)));

        let mut stamps = Vec::new();
        while poller.tick().await {
            stamps.push(Instant::now());
        }

        // checks at 0, 1, 3, 7; the next would land at 11
        assert_eq!(poller.checks(), 4);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= MIN_POLL_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_reports_timeout_as_transport() {
        let result: Result<(), _> = bounded(Duration::from_secs(1), async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_until_success() {
        let config = DriveConfig::default();
        let calls = AtomicU32::new(0);
        let result = retry_transient(&config, "new-order", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClientError::Transport("connection reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_stops_on_fatal() {
        let config = DriveConfig::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(&config, "finalize", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ClientError::Problem(crate::error::AcmeProblem::acme(
                    "badCSR", "",
                )))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
