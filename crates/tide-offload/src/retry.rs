//! Exponential backoff with jitter for block store calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tide_config::{log_offload_warn, RetrySection};
use tide_store::StoreError;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RetrySection> for RetryPolicy {
    fn from(cfg: &RetrySection) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): the capped exponential
    /// step plus up to half of it again as jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let step = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX))
            .min(self.max_delay);
        let jitter_ms = step.as_millis() as u64 / 2;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        step + Duration::from_millis(jitter)
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. `on_retry` is told about every retry.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &str,
        mut on_retry: impl FnMut(),
        mut f: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() || attempt + 1 >= self.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay(attempt);
                    log_offload_warn!(
                        op,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying block store call"
                    );
                    on_retry();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
