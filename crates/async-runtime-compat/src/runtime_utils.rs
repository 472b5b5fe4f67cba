//! Runtime-agnostic timer helpers
//!
//! `sleep` prefers Tokio's timer when a Tokio runtime is driving the
//! current thread and otherwise falls back to `async-io`, which runs its
//! own reactor thread and therefore works under smol, `block_on`, or any
//! other executor.

use futures::future::{self, Either};
use std::future::Future;
use std::pin::pin;
use std::time::Duration;

/// Error returned by [`timeout`] when the deadline passes first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed(pub Duration);

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deadline of {:?} elapsed", self.0)
    }
}

impl std::error::Error for Elapsed {}

/// Sleep for the specified duration using the current runtime's timer.
pub async fn sleep(duration: Duration) {
    #[cfg(feature = "tokio")]
    {
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::time::sleep(duration).await;
            return;
        }
    }

    async_io::Timer::after(duration).await;
}

/// Run `fut` to completion unless `duration` passes first.
pub async fn timeout<F>(duration: Duration, fut: F) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    let fut = pin!(fut);
    let timer = pin!(sleep(duration));
    match future::select(fut, timer).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(((), _)) => Err(Elapsed(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_sleep_without_runtime_uses_async_io() {
        futures::executor::block_on(async {
            let start = Instant::now();
            sleep(Duration::from_millis(50)).await;
            assert!(start.elapsed() >= Duration::from_millis(50));
        });
    }

    #[test]
    fn test_timeout_returns_output_when_fast() {
        futures::executor::block_on(async {
            let out = timeout(Duration::from_secs(1), async { 7 }).await;
            assert_eq!(out, Ok(7));
        });
    }

    #[test]
    fn test_timeout_elapses_on_pending_future() {
        futures::executor::block_on(async {
            let out = timeout(Duration::from_millis(30), future::pending::<()>()).await;
            assert_eq!(out, Err(Elapsed(Duration::from_millis(30))));
        });
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn test_sleep_inside_tokio_runtime() {
        let start = Instant::now();
        sleep(Duration::from_millis(20)).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
