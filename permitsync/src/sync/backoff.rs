use std::future::Future;
use std::time::Duration;

/// Linear backoff: the wait grows by one `step` per attempt, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    step: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self { step, max }
    }

    /// `attempt` is zero-based; the wait after the first failure is one step.
    pub fn delay(&self, attempt: u32) -> Duration {
        let step_ms = self.step.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let factor = u64::from(attempt.saturating_add(1));
        Duration::from_millis(step_ms.saturating_mul(factor).min(max_ms))
    }
}

/// Shared retry loop for the download and submit paths. Runs `op` up to
/// `max_attempts` times, sleeping `backoff.delay(..)` between attempts.
/// Errors the predicate rejects abort immediately.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    max_attempts: u32,
    backoff: Backoff,
    mut op: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts || !is_retryable(&err) {
                    return Err(err);
                }
                tokio::time::sleep(backoff.delay(attempt - 1)).await;
            }
        }
    }
}
