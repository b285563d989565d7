//! Retry helper with an explicit backoff schedule.
//!
//! The caller decides which errors are worth retrying, owns the attempt
//! counter, and gets a hook before every wait so it can escalate (for
//! example restart the network) once too many attempts have failed.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Ordered list of delays between retries. The last delay repeats forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    schedule: Vec<Duration>,
}

impl Backoff {
    /// Build a backoff from an explicit schedule.
    ///
    /// An empty schedule retries without waiting.
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }

    /// Same delay between every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(vec![delay])
    }

    /// A short delay before the first retry, then `rest` before every
    /// following one.
    pub fn two_phase(first: Duration, rest: Duration) -> Self {
        Self::new(vec![first, rest])
    }

    /// Delay before the retry following failure number `failure` (0-based).
    pub fn delay(&self, failure: usize) -> Duration {
        self.schedule
            .get(failure)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Run `op` until it succeeds or fails with an error `is_retryable` rejects.
///
/// After every retryable failure the caller-owned `attempts` counter is
/// incremented and `on_retry` is called with it and the error; the hook may
/// reset the counter. The helper then sleeps for the next delay of `backoff`.
/// Non-retryable errors are returned unchanged.
///
/// There is no attempt limit. Callers that need one return `false` from
/// `is_retryable` or race the returned future against a cancellation signal.
pub async fn retry<T, E, Op, Fut, Pred, Hook>(
    backoff: &Backoff,
    attempts: &mut u32,
    is_retryable: Pred,
    mut on_retry: Hook,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Pred: Fn(&E) -> bool,
    Hook: FnMut(&mut u32, &E),
    E: std::fmt::Display,
{
    let mut failures = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) => {
                *attempts += 1;
                on_retry(attempts, &err);

                let delay = backoff.delay(failures);
                warn!(
                    error = %err,
                    attempts = *attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
                failures += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
