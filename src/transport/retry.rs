use crate::error::TransportError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff with jitter for individual transmissions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    /// `base * 2^attempt` shifted by a jitter in `[-base/2, +base/2]`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as i64;
        let exponential = base.saturating_mul(1i64 << attempt.min(20));
        let half = base / 2;
        let jitter = if half > 0 {
            rand::thread_rng().gen_range(-half..=half)
        } else {
            0
        };
        Duration::from_millis((exponential + jitter).max(0) as u64)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// Non-transient errors (an oversized or unserializable payload) are
    /// returned immediately. After the last attempt its error is returned.
    pub async fn run<F, Fut>(&self, mut op: F) -> Result<(), TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), TransportError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt + 1 >= self.max_retries => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt, ?delay, error = %e, "transmission failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn io_error() -> TransportError {
        TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
    }

    #[test]
    fn test_delay_bounds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        for attempt in 0..4 {
            let expected = 100u64 << attempt;
            for _ in 0..50 {
                let d = policy.delay_for(attempt).as_millis() as u64;
                assert!(d >= expected - 50 && d <= expected + 50, "attempt {} gave {}", attempt, d);
            }
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(io_error()) } else { Ok(()) } }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(io_error()) }
            })
            .await;

        assert!(matches!(result, Err(TransportError::Io(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_not_retried() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::PayloadTooLarge { size: 10, limit: 5 }) }
            })
            .await;

        assert!(matches!(result, Err(TransportError::PayloadTooLarge { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
