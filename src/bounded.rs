//! Bounded waiting.
//!
//! Every wait that crosses the sandbox boundary goes through [`run_bounded`].
//! A timeout only stops *waiting*: the abandoned future is dropped, never
//! preempted, so anything it acquired (a child process, a file) may still be
//! alive and must be cleaned up by its owner.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};

/// Interval used by [`wait_until`] between predicate checks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A bounded wait elapsed before the operation resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out after {millis} milliseconds")]
pub struct TimeoutError {
    /// The configured bound, in milliseconds.
    pub millis: u64,
}

/// Race `op` against a timer of `limit`.
pub async fn run_bounded<F>(op: F, limit: Duration) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    timeout(limit, op).await.map_err(|_| TimeoutError {
        millis: limit.as_millis() as u64,
    })
}

/// Poll `condition` every [`POLL_INTERVAL`] until it holds or `limit` elapses.
///
/// Only meant for low-frequency readiness checks.
pub async fn wait_until<P>(mut condition: P, limit: Duration) -> Result<(), TimeoutError>
where
    P: FnMut() -> bool,
{
    run_bounded(
        async move {
            while !condition() {
                sleep(POLL_INTERVAL).await;
            }
        },
        limit,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_resolves_before_deadline() {
        let value = run_bounded(async { 42 }, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_never_resolving_operation_times_out() {
        let started = Instant::now();
        let err = run_bounded(std::future::pending::<()>(), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert_eq!(err, TimeoutError { millis: 50 });
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_abandoned_operation_is_dropped() {
        struct Flag(Arc<AtomicUsize>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let flag = Flag(dropped.clone());
        let op = async move {
            let _flag = flag;
            std::future::pending::<()>().await;
        };

        assert!(run_bounded(op, Duration::from_millis(20)).await.is_err());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_until_polls_predicate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        wait_until(
            move || counter.fetch_add(1, Ordering::SeqCst) >= 3,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let err = wait_until(|| false, Duration::from_millis(30)).await.unwrap_err();
        assert_eq!(err.millis, 30);
    }
}
