use crate::budget::TimeBudget;
use crate::error::HostError;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Application-facing half of the shutdown machinery.
///
/// Before [`initiate`](Self::initiate) is called, [`remaining_time`](Self::remaining_time)
/// reports the configured timeout as a best guess. Afterwards it counts down
/// the budget handed over by the hosting side.
#[derive(Debug)]
pub struct ApplicationShutdown {
    token: CancellationToken,
    imminent: CancellationToken,
    initial_timeout: Duration,
    initiated: AtomicBool,
    budget: ArcSwapOption<TimeBudget>,
}

impl ApplicationShutdown {
    pub fn new(initial_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            imminent: CancellationToken::new(),
            initial_timeout,
            initiated: AtomicBool::new(false),
            budget: ArcSwapOption::empty(),
        }
    }

    /// Signal hosted code should observe to stop.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// True once the application-facing signal has fired.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once shutdown has been initiated (the signal may still be pending).
    pub fn is_initiated(&self) -> bool {
        self.initiated.load(Ordering::Acquire)
    }

    /// Completes right before the application-facing signal fires.
    pub async fn imminent(&self) {
        self.imminent.cancelled().await
    }

    /// Completes once the application-facing signal has fired.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// `Err(HostError::Cancelled)` once the signal has fired.
    pub fn check(&self) -> Result<(), HostError> {
        if self.is_triggered() {
            Err(HostError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn initial_timeout(&self) -> Duration {
        self.initial_timeout
    }

    pub fn remaining_time(&self) -> Duration {
        match self.budget.load().as_deref() {
            Some(budget) => budget.remaining(),
            None => self.initial_timeout,
        }
    }

    /// Start counting down `remaining`, resolve [`imminent`](Self::imminent)
    /// and fire the signal from a separate task. Only the first call has an
    /// effect; returns whether this call initiated shutdown.
    pub fn initiate(&self, remaining: Duration) -> bool {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let remaining = remaining.min(self.initial_timeout);
        self.budget
            .store(Some(Arc::new(TimeBudget::started(remaining))));
        debug!(remaining = ?remaining, "Application shutdown initiated");

        self.imminent.cancel();

        let token = self.token.clone();
        tokio::spawn(async move {
            token.cancel();
        });

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_remaining_time_before_initiate() {
        let shutdown = ApplicationShutdown::new(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(shutdown.remaining_time(), Duration::from_secs(10));
        assert!(!shutdown.is_initiated());
        assert!(!shutdown.is_triggered());
        assert!(shutdown.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_counts_down_and_fires() {
        let shutdown = ApplicationShutdown::new(Duration::from_secs(10));

        assert!(shutdown.initiate(Duration::from_secs(6)));
        shutdown.imminent().await;
        shutdown.cancelled().await;

        assert!(shutdown.is_triggered());
        assert!(matches!(shutdown.check(), Err(HostError::Cancelled)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(shutdown.remaining_time(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_initiate_is_ignored() {
        let shutdown = ApplicationShutdown::new(Duration::from_secs(10));

        assert!(shutdown.initiate(Duration::from_secs(3)));
        assert!(!shutdown.initiate(Duration::from_secs(9)));
        assert_eq!(shutdown.remaining_time(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_never_grows_past_initial() {
        let shutdown = ApplicationShutdown::new(Duration::from_secs(2));

        shutdown.initiate(Duration::from_secs(30));
        assert_eq!(shutdown.remaining_time(), Duration::from_secs(2));
    }
}
