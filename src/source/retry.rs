use super::provider::ProviderError;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Early-exit hook for a wait loop: returns a reason once waiting is pointless
/// (for example because the task that would create the resource has stopped).
#[async_trait]
pub trait AbortCheck: Send + Sync {
    async fn abort_reason(&self) -> Option<String>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Ready(T),
    Cancelled,
    Aborted(String),
}

/// Fixed-interval retry for "not found yet" errors.
///
/// Attempts are unbounded; the loop ends only on success, on a non-retryable
/// error, on cancellation, or when the abort check fires. Cancellation is
/// observed during the attempt itself and during every sleep, so it takes
/// effect within one interval.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn retry_not_found<T, F, Fut>(
        &self,
        what: &str,
        token: &CancellationToken,
        abort: Option<&dyn AbortCheck>,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempts: u64 = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(RetryOutcome::Cancelled),
                result = operation() => result,
            };

            match result {
                Ok(value) => {
                    if attempts > 0 {
                        info!(target_name = %what, attempts = attempts, "Resource became available");
                    }
                    return Ok(RetryOutcome::Ready(value));
                }
                Err(e) if e.is_not_found() => {
                    attempts += 1;
                    if attempts == 1 {
                        info!(target_name = %what, "Waiting for resource to be created");
                    } else {
                        debug!(target_name = %what, attempts = attempts, error = %e, "Still not found");
                    }
                }
                Err(e) => return Err(e),
            }

            if let Some(check) = abort {
                let reason = tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(RetryOutcome::Cancelled),
                    reason = check.abort_reason() => reason,
                };
                if let Some(reason) = reason {
                    info!(target_name = %what, reason = %reason, "Giving up waiting for resource");
                    return Ok(RetryOutcome::Aborted(reason));
                }
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(RetryOutcome::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct AbortAfter {
        calls: AtomicUsize,
        after: usize,
    }

    #[async_trait]
    impl AbortCheck for AbortAfter {
        async fn abort_reason(&self) -> Option<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (n >= self.after).then(|| "task stopped".to_string())
        }
    }

    #[tokio::test]
    async fn test_retries_until_found() {
        let policy = RetryPolicy::fixed(Duration::from_millis(5));
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let outcome = policy
            .retry_not_found("group", &token, None, move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(ProviderError::NotFound("group".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::Ready(42));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let policy = RetryPolicy::fixed(Duration::from_millis(5));
        let token = CancellationToken::new();

        let result: Result<RetryOutcome<()>, _> = policy
            .retry_not_found("group", &token, None, || async {
                Err(ProviderError::AccessDenied("denied".into()))
            })
            .await;

        assert!(matches!(result, Err(ProviderError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn test_cancellation_stops_waiting_within_one_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(1));
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let outcome: RetryOutcome<()> = policy
            .retry_not_found("group", &token, None, || async {
                Err(ProviderError::NotFound("group".into()))
            })
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_abort_check_ends_wait() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1));
        let token = CancellationToken::new();
        let check = AbortAfter {
            calls: AtomicUsize::new(0),
            after: 2,
        };

        let outcome: RetryOutcome<()> = policy
            .retry_not_found("group", &token, Some(&check), || async {
                Err(ProviderError::NotFound("group".into()))
            })
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::Aborted("task stopped".to_string()));
    }
}
