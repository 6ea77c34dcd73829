//! Backoff for analyze requests that never reached the server.
//!
//! A request is repeated only while it fails with
//! [`VisionError::TransientNetwork`](crate::VisionError::TransientNetwork).
//! The final error records how many attempts were made.

use crate::config::NetworkConfig;
use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry budget and backoff shape for one transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total tries per request, the first one included.
    pub max_attempts: u32,
    /// Sleep before the first retry. Doubles on every further retry.
    pub base_delay: Duration,
    /// Upper bound for any single sleep.
    pub max_delay: Duration,
    /// Scale every sleep by a random factor in 0.5..1.5.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: NetworkConfig::MAX_ATTEMPTS,
            base_delay: NetworkConfig::RETRY_BASE_DELAY,
            max_delay: NetworkConfig::RETRY_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never repeat a request.
    pub fn disabled() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// At least one attempt is always made.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sleeps to take between attempts, one per allowed retry.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.base_delay.min(self.max_delay),
            max: self.max_delay,
            jitter: self.jitter,
            remaining: self.max_attempts.max(1) - 1,
        }
    }
}

/// Delays between attempts of one request.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    jitter: bool,
    remaining: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);

        if self.jitter {
            let factor = rand::rng().random_range(0.5..1.5);
            Some(delay.mul_f64(factor).min(self.max))
        } else {
            Some(delay)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining as usize;
        (remaining, Some(remaining))
    }
}

/// Run `request` until it succeeds, fails for a reason other than the network,
/// or the backoff runs out. `request` receives the 1-based attempt number.
pub(crate) async fn with_retries<T, F, Fut>(config: &RetryConfig, mut request: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = config.backoff();
    let mut attempt = 1;

    loop {
        let err = match request(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("Request went through on attempt {}", attempt);
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() => err,
            Err(err) => return Err(err),
        };

        match backoff.next() {
            Some(delay) => {
                warn!("Attempt {} failed: {}. Retrying in {:?}", attempt, err, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                warn!("Giving up after {} attempts: {}", attempt, err);
                return Err(err.with_attempts(attempt));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VisionError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> VisionError {
        VisionError::TransientNetwork {
            url: "http://127.0.0.1:1/analyze_image".into(),
            attempts: 1,
            message: "connection reset".into(),
            source: None,
        }
    }

    fn fixed(attempts: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let delays: Vec<_> = RetryConfig::new()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300))
            .with_jitter(false)
            .backoff()
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn test_jittered_backoff_stays_in_bounds() {
        let config = RetryConfig::new()
            .with_max_attempts(20)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(1));

        for delay in config.backoff() {
            assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_single_attempt_has_no_backoff() {
        assert_eq!(RetryConfig::new().with_max_attempts(0).max_attempts, 1);
        assert_eq!(RetryConfig::disabled().backoff().count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let value = with_retries(&fixed(3), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_attempts() {
        let err = with_retries(&fixed(3), |_| async { Err::<(), _>(transient()) })
            .await
            .unwrap_err();
        assert!(matches!(err, VisionError::TransientNetwork { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_server_errors_are_final() {
        let calls = AtomicU32::new(0);
        let err = with_retries(&fixed(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(VisionError::AnalysisFailed {
                    url: "http://127.0.0.1:1/analyze_image".into(),
                    status: 500,
                    body: "boom".into(),
                })
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, VisionError::AnalysisFailed { status: 500, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
