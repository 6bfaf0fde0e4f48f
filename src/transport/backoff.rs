//! Exponential backoff for connect and authentication retries.
//!
//! In-session command failures never retry here; they surface to the
//! executor, which owns recovery policy.

use std::future::Future;
use std::time::Duration;

use log::warn;
use rand::Rng;

use crate::error::{Result, TransportError};

/// Retry policy: exponential delay with a cap and jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Fractional jitter applied to each delay, e.g. 0.1 for ±10%.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(2),
            cap: Duration::from_secs(15),
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// The delay before retry number `attempt` (0-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let spread = capped * self.jitter;
        let jittered = capped + rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Run `op` until it succeeds, a non-retryable error occurs, or the
    /// attempt budget is spent.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        "{what} failed (attempt {}/{}): {err}; retrying in {delay:?}",
                        attempt + 1,
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_caps() {
        let backoff = Backoff {
            jitter: 0.0,
            ..Backoff::default()
        };
        assert_eq!(backoff.delay(0), Duration::from_secs(2));
        assert_eq!(backoff.delay(1), Duration::from_secs(4));
        assert_eq!(backoff.delay(2), Duration::from_secs(8));
        // 16s exceeds the cap
        assert_eq!(backoff.delay(3), Duration::from_secs(15));
        assert_eq!(backoff.delay(10), Duration::from_secs(15));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::default();
        for _ in 0..50 {
            let d = backoff.delay(1).as_secs_f64();
            assert!((3.6..=4.4).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            ..Backoff::default()
        };
        let result: Result<u32> = backoff
            .retry("connect", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TransportError::Disconnected)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let backoff = Backoff {
            base: Duration::from_millis(1),
            ..Backoff::default()
        };
        let result: Result<()> = backoff
            .retry("connect", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TransportError::AuthenticationFailed {
                        user: "admin".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
