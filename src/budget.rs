//! Countdown over a fixed duration.

use std::time::Duration;
use tokio::time::Instant;

/// Immutable countdown: `remaining = duration - elapsed`, clamped at zero.
///
/// A budget is created pending and reports its full duration until
/// [`TimeBudget::start`] produces the counting copy. Budgets are never reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget {
    duration: Duration,
    started_at: Option<Instant>,
}

impl TimeBudget {
    /// Create a pending budget.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started_at: None,
        }
    }

    /// Create a budget that starts counting now.
    pub fn started(duration: Duration) -> Self {
        Self::new(duration).start()
    }

    /// Begin counting from now. Starting an already started budget keeps
    /// the original start instant.
    pub fn start(self) -> Self {
        match self.started_at {
            Some(_) => self,
            None => Self {
                duration: self.duration,
                started_at: Some(Instant::now()),
            },
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map(|started_at| started_at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Full duration while pending, live countdown once started.
    pub fn remaining(&self) -> Duration {
        match self.started_at {
            Some(started_at) => self.duration.saturating_sub(started_at.elapsed()),
            None => self.duration,
        }
    }

    pub fn has_expired(&self) -> bool {
        self.is_started() && self.remaining().is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pending_budget_reports_full_duration() {
        let budget = TimeBudget::new(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(!budget.is_started());
        assert_eq!(budget.remaining(), Duration::from_secs(5));
        assert_eq!(budget.elapsed(), Duration::ZERO);
        assert!(!budget.has_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_budget_counts_down() {
        let budget = TimeBudget::started(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(budget.remaining(), Duration::from_secs(3));
        assert_eq!(budget.elapsed(), Duration::from_secs(2));
        assert!(!budget.has_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_clamps_at_zero() {
        let budget = TimeBudget::started(Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(budget.remaining(), Duration::ZERO);
        assert!(budget.has_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_original_instant() {
        let budget = TimeBudget::started(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(2)).await;

        let restarted = budget.start();
        assert_eq!(restarted, budget);
        assert_eq!(restarted.remaining(), Duration::from_secs(3));
    }
}
