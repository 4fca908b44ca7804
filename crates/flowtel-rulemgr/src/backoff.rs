//! Capped exponential backoff for switch requests.

use crate::error::ChannelError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry schedule: `base_delay * 2^attempt`, capped at `max_delay`, for at
/// most `max_attempts` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the failed attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, the
    /// attempts run out, or `cancel` fires.
    pub async fn retry<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ChannelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt + 1 >= attempts {
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            debug!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Bounds `fut` by `timeout`, mapping elapsed time to [`ChannelError::Timeout`].
pub async fn with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, ChannelError>
where
    Fut: Future<Output = Result<T, ChannelError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(ChannelError::Timeout(timeout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts: 4,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 10,
        };
        let delays: Vec<u128> = (0..6).map(|a| policy.delay_for(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(policy.delay_for(64), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = &AtomicU32::new(0);
        let result = fast()
            .retry("probe", &CancellationToken::new(), move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ChannelError::Transport("refused".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .retry("probe", &CancellationToken::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ChannelError::Transport("refused".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = fast()
            .retry("push", &CancellationToken::new(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ChannelError::Rejected("bad policy".into()))
            })
            .await;
        assert_eq!(result, Err(ChannelError::Rejected("bad policy".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_retry() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = fast()
            .retry("push", &cancel, || std::future::pending())
            .await;
        assert_eq!(result, Err(ChannelError::Cancelled));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_channel_error() {
        let result: Result<(), _> =
            with_timeout(Duration::from_millis(5), std::future::pending()).await;
        assert_eq!(result, Err(ChannelError::Timeout(Duration::from_millis(5))));
    }
}
