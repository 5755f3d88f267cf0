//! Deadlines and timeout helpers.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ToolMeshError;

/// Absolute point in time after which a pending operation is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Deadline(Instant);

impl Deadline {
    /// Deadline `duration` from now.
    pub fn after(duration: Duration) -> Self {
        Self(Instant::now() + duration)
    }

    pub fn after_ms(ms: u64) -> Self {
        Self::after(Duration::from_millis(ms))
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn remaining_ms(&self) -> u64 {
        self.remaining().as_millis() as u64
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// The earlier of two deadlines.
    pub fn earliest(self, other: Deadline) -> Deadline {
        self.min(other)
    }

    /// Tighten this deadline so it is at most `cap` from now.
    pub fn capped(self, cap: Option<Duration>) -> Deadline {
        match cap {
            Some(cap) => self.earliest(Deadline::after(cap)),
            None => self,
        }
    }
}

/// Run a future until `deadline`, mapping expiry to [`ToolMeshError::Timeout`].
pub async fn with_deadline<T>(
    deadline: Deadline,
    future: impl Future<Output = Result<T, ToolMeshError>>,
) -> Result<T, ToolMeshError> {
    let budget_ms = deadline.remaining_ms();
    match tokio::time::timeout_at(deadline.instant(), future).await {
        Ok(result) => result,
        Err(_) => Err(ToolMeshError::Timeout(budget_ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_after_duration() {
        let deadline = Deadline::after_ms(100);
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining_ms(), 100);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn capped_never_extends_a_deadline() {
        let deadline = Deadline::after_ms(50);
        assert_eq!(deadline.capped(Some(Duration::from_secs(10))), deadline);
        assert_eq!(deadline.capped(None), deadline);

        let tightened = Deadline::after_ms(5_000).capped(Some(Duration::from_millis(20)));
        assert_eq!(tightened.remaining_ms(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn with_deadline_reports_budget_on_expiry() {
        let deadline = Deadline::after_ms(30);
        let err = with_deadline(deadline, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ToolMeshError>(())
        })
        .await
        .expect_err("sleeping past the deadline should time out");
        assert!(matches!(err, ToolMeshError::Timeout(30)));
    }

    #[tokio::test]
    async fn with_deadline_passes_through_results() {
        let value = with_deadline(Deadline::after_ms(1_000), async { Ok(7) })
            .await
            .expect("fast future should complete");
        assert_eq!(value, 7);
    }
}
