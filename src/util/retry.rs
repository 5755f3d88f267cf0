//! Deadline-bounded retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use crate::error::ToolMeshError;

use super::timeout::Deadline;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Execute an async operation, retrying retryable errors until `deadline`.
    ///
    /// A retry is skipped when its backoff would end past the deadline; the
    /// last error is returned instead.
    pub async fn execute_until<F, Fut, T>(
        &self,
        deadline: Deadline,
        mut operation: F,
    ) -> Result<T, ToolMeshError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ToolMeshError>>,
    {
        let mut backoff = self.initial_backoff;
        let attempts = self.max_attempts.max(1);

        for attempt in 0..attempts {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() || attempt + 1 >= attempts {
                return Err(error);
            }

            // Jitter: 75%-125% of backoff
            let jitter_factor = 0.75 + (rand_factor() * 0.5);
            let sleep_duration = Duration::from_secs_f64(backoff.as_secs_f64() * jitter_factor);
            if sleep_duration >= deadline.remaining() {
                return Err(error);
            }

            tracing::warn!(
                attempt = attempt + 1,
                max_attempts = attempts,
                backoff_ms = sleep_duration.as_millis() as u64,
                error = %error,
                "retrying after error"
            );
            tokio::time::sleep(sleep_duration).await;

            backoff = Duration::from_secs_f64(
                (backoff.as_secs_f64() * self.multiplier).min(self.max_backoff.as_secs_f64()),
            );
        }

        Err(ToolMeshError::InvalidState(
            "retry loop exited without a result".into(),
        ))
    }
}

/// Simple pseudo-random factor [0, 1) without pulling in rand crate.
fn rand_factor() -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);

    let hash = hasher.finish();
    (hash % 10000) as f64 / 10000.0
}
