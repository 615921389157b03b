use std::future::Future;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_max: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            jitter_max: Some(Duration::from_millis(50)),
        }
    }
}

impl RetryConfig {
    /// Polling schedule for a contended lock: short first waits, capped at
    /// 250ms, with enough attempts to cover roughly `budget`.
    pub fn lock_polling(budget: Duration) -> Self {
        let max_backoff = Duration::from_millis(250);
        let attempts = (budget.as_millis() / max_backoff.as_millis()).max(1) as usize + 4;
        Self {
            max_attempts: attempts,
            base_backoff: Duration::from_millis(10),
            max_backoff,
            jitter_max: Some(Duration::from_millis(25)),
        }
    }

    /// Backoff before attempt `retry` (1-based), without jitter.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    fn jitter(&self) -> Duration {
        match self.jitter_max {
            Some(max) if !max.is_zero() => {
                let max_ms = max.as_millis() as u64;
                Duration::from_millis(rand::random::<u64>() % (max_ms + 1))
            }
            _ => Duration::ZERO,
        }
    }
}

/// Runs `f` until it succeeds, `should_retry` rejects the error, or
/// `max_attempts` is spent. Only errors accepted by `should_retry` are retried.
pub async fn retry_while<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut should_retry: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt as usize >= config.max_attempts || !should_retry(&e) {
                    return Err(e);
                }
                let wait = config.backoff_for(attempt) + config.jitter();
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter_max: None,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let counter = AtomicUsize::new(0);

        let res: Result<usize, &'static str> = retry_while(
            &fast(),
            |_| true,
            || async {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("busy")
                } else {
                    Ok(n)
                }
            },
        )
        .await;

        assert_eq!(res, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicUsize::new(0);

        let res: Result<(), &'static str> = retry_while(
            &fast(),
            |_| true,
            || async {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("busy")
            },
        )
        .await;

        assert!(res.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let counter = AtomicUsize::new(0);

        let res: Result<(), &'static str> = retry_while(
            &fast(),
            |e| *e == "busy",
            || async {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("broken")
            },
        )
        .await;

        assert_eq!(res, Err("broken"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let cfg = fast();
        assert_eq!(cfg.backoff_for(1), Duration::from_millis(1));
        assert_eq!(cfg.backoff_for(2), Duration::from_millis(2));
        assert_eq!(cfg.backoff_for(3), Duration::from_millis(4));
        assert_eq!(cfg.backoff_for(40), Duration::from_millis(4));
    }

    #[test]
    fn lock_polling_covers_budget() {
        let cfg = RetryConfig::lock_polling(Duration::from_secs(5));
        assert!(cfg.max_attempts >= 20);
    }
}
