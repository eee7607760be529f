//! Retry with exponential backoff for engine calls.
//!
//! Only failures the engine contract marks retriable are retried; semantic
//! failures (`no_person`, invalid image, terminal job failure) surface
//! immediately.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::EngineError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 means a single attempt).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Whether to stretch each delay by up to a quarter of itself.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// The delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.initial_delay.mul_f64(factor).min(self.max_delay);
        if self.jitter {
            base + quarter_jitter(base)
        } else {
            base
        }
    }
}

/// Up to 25% of `base` as added spread, seeded from the clock's nanosecond
/// field. Enough to keep concurrent retries from landing in lockstep without
/// dragging in a random crate.
fn quarter_jitter(base: Duration) -> Duration {
    let cap_ms = base.as_millis() as u64 / 4;
    if cap_ms == 0 {
        return Duration::ZERO;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    Duration::from_millis(nanos % (cap_ms + 1))
}

/// Run `operation`, retrying retriable engine failures with backoff.
pub async fn retry_engine_call<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(err) if err.is_retriable() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "{} failed ({}), retry {}/{} in {:?}",
                    operation_name, err, attempt, config.max_retries, delay
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
