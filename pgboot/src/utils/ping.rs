//! Readiness probing
//!
//! Bounded retry loop used to wait until a freshly opened store accepts
//! requests.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Default upper bound on the time spent probing.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(10);
/// Default pause between two probes.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Call `ping` until it succeeds or `timeout` has elapsed since the first call.
///
/// The first probe runs immediately. After a failure the loop sleeps for
/// `interval` and retries, but only if the retry would start no later than
/// `timeout` after the first probe. The result of the last probe is returned.
pub async fn wait_for_ping<F, Fut, E>(mut ping: F, timeout: Duration, interval: Duration) -> Result<(), E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 1;

    loop {
        let err = match ping().await {
            Ok(()) => {
                if attempt > 1 {
                    tracing::debug!(attempt, elapsed = ?started.elapsed(), "Store became reachable");
                }
                return Ok(());
            }
            Err(err) => err,
        };

        if started.elapsed().saturating_add(interval) > timeout {
            tracing::debug!(attempt, ?timeout, "Giving up on store readiness");
            return Err(err);
        }

        tracing::trace!(attempt, ?interval, "Store not reachable yet, retrying");
        sleep(interval).await;
        attempt += 1;
    }
}

/// [`wait_for_ping`] with a 10 second timeout and a 250 millisecond interval.
pub async fn wait_for_ping_auto<F, Fut, E>(ping: F) -> Result<(), E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    wait_for_ping(ping, DEFAULT_RETRY_TIMEOUT, DEFAULT_RETRY_INTERVAL).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn failing_until(successful_attempt: u32, calls: &Cell<u32>) -> impl FnMut() -> std::future::Ready<Result<(), &'static str>> + '_ {
        move || {
            calls.set(calls.get() + 1);
            if calls.get() >= successful_attempt {
                std::future::ready(Ok(()))
            } else {
                std::future::ready(Err("down"))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success_does_not_sleep() {
        let calls = Cell::new(0);
        let started = Instant::now();

        wait_for_ping(failing_until(1, &calls), Duration::from_secs(1), Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(calls.get(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures() {
        let calls = Cell::new(0);
        let started = Instant::now();

        wait_for_ping(failing_until(4, &calls), Duration::from_secs(1), Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(calls.get(), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_timeout_with_last_error() {
        let calls = Cell::new(0);
        let started = Instant::now();

        let err = wait_for_ping(failing_until(u32::MAX, &calls), Duration::from_secs(1), Duration::from_millis(250))
            .await
            .unwrap_err();

        assert_eq!(err, "down");
        assert_eq!(calls.get(), 5);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_below_interval_makes_one_attempt() {
        let calls = Cell::new(0);

        let result = wait_for_ping(failing_until(2, &calls), Duration::from_millis(100), Duration::from_millis(250)).await;

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_uses_default_timings() {
        let calls = Cell::new(0);
        let started = Instant::now();

        assert!(wait_for_ping_auto(failing_until(u32::MAX, &calls)).await.is_err());

        assert_eq!(calls.get(), 41);
        assert_eq!(started.elapsed(), DEFAULT_RETRY_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_interval_gives_up_without_overflow() {
        let calls = Cell::new(0);

        let result = wait_for_ping(failing_until(u32::MAX, &calls), Duration::from_secs(1), Duration::MAX).await;

        assert_eq!(result, Err("down"));
        assert_eq!(calls.get(), 1);
    }
}
