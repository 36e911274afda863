use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::AppConfig;
use crate::error::{DataError, DataResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 2,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        }
    }
}

/// Runs `op` under the policy's timeout, retrying transport failures with a
/// linear backoff of `backoff * attempt`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> DataResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DataResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DataError::timeout(format!(
                "{label} took longer than {}ms",
                policy.timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.backoff * attempt;
                warn!(
                    "{label} failed ({}), retry {attempt}/{} in {}ms",
                    err.kind(),
                    policy.max_retries,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Logs a failed branch of a fan-out and keeps going with what succeeded.
pub fn settled<T>(label: &str, result: DataResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("{label} unavailable ({}): {err}", err.kind());
            None
        }
    }
}

/// Keeps at most one request in flight; starting a new one aborts the
/// previous.
#[derive(Debug, Default)]
pub struct LatestRequest {
    current: Mutex<Option<AbortHandle>>,
}

pub struct PendingRequest<T> {
    handle: JoinHandle<DataResult<T>>,
}

impl LatestRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<T, Fut>(&self, fut: Fut) -> PendingRequest<T>
    where
        T: Send + 'static,
        Fut: Future<Output = DataResult<T>> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle.abort_handle());
        if let Some(previous) = previous {
            if !previous.is_finished() {
                debug!("superseding in-flight request");
            }
            previous.abort();
        }
        PendingRequest { handle }
    }
}

impl<T> PendingRequest<T> {
    pub async fn wait(self) -> DataResult<T> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => Err(DataError::Cancelled),
            Err(err) => Err(DataError::unknown(format!("request task failed: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(3),
            max_retries: 2,
            backoff: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let result = with_retry(&policy(), "attendance", move || async move {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(DataError::network("connection reset"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_validation_errors() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let result: DataResult<()> = with_retry(&policy(), "fees", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(DataError::validation("unknown attendance status 'sick'"))
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_retry_with_linear_backoff() {
        let started = Instant::now();
        let result: DataResult<()> = with_retry(&policy(), "payments", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        // Three 3s attempts plus 1s and 2s of backoff.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(12), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(13), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn newer_request_wins() {
        let latest = LatestRequest::new();
        let first = latest.spawn(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, DataError>("stale")
        });
        let second = latest.spawn(async { Ok::<_, DataError>("fresh") });

        assert_eq!(first.wait().await.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(second.wait().await.unwrap(), "fresh");
    }

    #[test]
    fn settled_keeps_successes() {
        assert_eq!(settled("fees", Ok::<_, DataError>(3)), Some(3));
        assert_eq!(settled::<u32>("fees", Err(DataError::network("down"))), None);
    }

    #[test]
    fn policy_follows_config() {
        let config = AppConfig {
            request_timeout_ms: 8_000,
            max_retries: 1,
            retry_backoff_ms: 250,
            ..AppConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.timeout, Duration::from_secs(8));
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.backoff, Duration::from_millis(250));
    }
}
