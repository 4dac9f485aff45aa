use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::DuhError;

/// Races `fut` against `token`'s cancellation signal. Dropping `fut` when
/// cancelled tears down whatever in-flight work it holds — an HTTP
/// provider call's underlying connection closes rather than running to
/// completion. A session with no token behaves exactly like a plain await.
pub async fn with_cancellation<F, T>(token: Option<&CancellationToken>, fut: F) -> Result<T, DuhError>
where
    F: std::future::Future<Output = Result<T, DuhError>>,
{
    match token {
        None => fut.await,
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(DuhError::Consensus("session cancelled".to_string())),
                result = fut => result,
            }
        }
    }
}

/// Exponential backoff with jitter, mirroring the retry policy every
/// provider call in this crate goes through.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: u32, error: &DuhError) -> Duration {
        if let Some(retry_after) = error.retry_after() {
            return Duration::from_secs(retry_after).min(self.max_delay);
        }
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(20));
        let mut delay = exp.min(self.max_delay);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            delay = Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0));
        }
        delay
    }
}

/// Runs `f` up to `max_retries + 1` times, sleeping between attempts per
/// `config`. Non-retryable errors propagate immediately. `on_retry`, if
/// given, is invoked with `(attempt, delay, error)` before each sleep.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    mut on_retry: Option<impl FnMut(u32, Duration, &DuhError)>,
    mut f: F,
) -> Result<T, DuhError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DuhError>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !error.is_retryable() || attempt >= config.max_retries {
                    return Err(error);
                }
                let delay = config.delay_for(attempt, &error);
                if let Some(cb) = on_retry.as_mut() {
                    cb(attempt + 1, delay, &error);
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_completion() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32, DuhError> = with_cancellation(Some(&token), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        })
        .await;
        assert!(matches!(result, Err(DuhError::Consensus(_))));
    }

    #[tokio::test]
    async fn no_token_behaves_like_plain_await() {
        let result: Result<u32, DuhError> = with_cancellation(None, async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn non_retryable_error_has_no_retry_after_bypass() {
        let err = DuhError::ProviderAuth {
            provider_id: "x".into(),
            message: "bad key".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limit_with_hint_is_capped_by_max_delay() {
        let config = RetryConfig {
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        let err = DuhError::ProviderRateLimit {
            provider_id: "x".into(),
            retry_after: Some(30),
        };
        assert_eq!(config.delay_for(0, &err), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_first_call_succeeds() {
        let config = RetryConfig::default();
        let result: Result<u32, DuhError> =
            retry_with_backoff(&config, None::<fn(u32, Duration, &DuhError)>, || async { Ok(42) })
                .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn exhausts_retries_then_propagates() {
        let config = RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), DuhError> = retry_with_backoff(
            &config,
            None::<fn(u32, Duration, &DuhError)>,
            || {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async {
                    Err(DuhError::ProviderTimeout {
                        provider_id: "x".into(),
                        timeout_ms: 10,
                    })
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
