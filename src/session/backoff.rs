//! Reconnection backoff policy
//!
//! One policy object carries the timing semantics for both sides: clients
//! drive their reconnect loops with it, and the server derives its grace
//! window from the same numbers, so the two agree on how long a session is
//! worth keeping alive.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts.
    pub max_attempts: u32,
    /// Delay before the second attempt (the first fires immediately).
    pub initial_delay: Duration,
    /// Ceiling on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Jitter fraction in [0, 1]; each delay is scaled by a random factor
    /// in [1 - jitter, 1 + jitter].
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 1.5,
            jitter: 0.2,
        }
    }
}

/// Terminal outcome of a reconnect loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconnectError {
    #[error("maximum reconnection attempts ({0}) reached")]
    MaxAttemptsReached(u32),
}

impl ReconnectPolicy {
    /// Deterministic delay for `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let delay = base * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// Jittered delay for `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_millis((base * factor) as u64)
    }

    /// Grace window matched to this policy and the keepalive interval:
    /// sessions survive two missed keepalives.
    pub fn grace_window(keepalive_interval: Duration) -> Duration {
        keepalive_interval * 2
    }

    /// Drive a reconnect loop: call `connect_fn` until it succeeds or the
    /// attempt budget is exhausted, sleeping the policy's delay between
    /// attempts. This is the documented client contract; the server only
    /// uses the timing accessors.
    pub async fn run<F, Fut, T, E>(&self, mut connect_fn: F) -> Result<T, ReconnectError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self.delay_for(attempt);
                info!(
                    "Waiting {:?} before reconnect attempt {}/{}",
                    delay, attempt, self.max_attempts
                );
                sleep(delay).await;
            }

            match connect_fn(attempt).await {
                Ok(value) => {
                    info!("Reconnection successful on attempt {}", attempt);
                    return Ok(value);
                }
                Err(error) => {
                    warn!(
                        "Reconnection attempt {}/{} failed: {}",
                        attempt, self.max_attempts, error
                    );
                }
            }
        }

        Err(ReconnectError::MaxAttemptsReached(self.max_attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_base_delay_growth() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(1500));
        assert_eq!(policy.base_delay(3), Duration::from_millis(2250));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(50), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = ReconnectPolicy {
            jitter: 0.2,
            ..Default::default()
        };
        for _ in 0..1000 {
            let delay = policy.delay_for(2).as_millis() as f64;
            // base is 1500ms; jittered into [1200, 1800].
            assert!((1200.0..=1800.0).contains(&delay), "delay {} out of bounds", delay);
        }
    }

    #[test]
    fn test_grace_window_is_twice_keepalive() {
        assert_eq!(
            ReconnectPolicy::grace_window(Duration::from_secs(30)),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn test_run_succeeds_after_failures() {
        let policy = ReconnectPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 1.0,
            jitter: 0.0,
        };

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result = policy
            .run(move |_attempt| {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("still down")
                    } else {
                        Ok("up")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "up");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_exhausts_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
            jitter: 0.0,
        };

        let result: Result<(), _> = policy.run(|_| async { Err::<(), _>("refused") }).await;
        assert!(matches!(result, Err(ReconnectError::MaxAttemptsReached(3))));
    }
}
