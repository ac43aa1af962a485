use super::controller::ApplicationHost;
use crate::discovery::ServiceBeacon;
use crate::error::AppError;
use crate::state::{ApplicationState, RunResult};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinError;
use tokio::time::timeout;
use tracing::{info, warn};

/// How a raced application phase ended.
pub(super) enum PhaseOutcome {
    /// The phase finished before shutdown was requested.
    Completed(Result<(), AppError>),
    /// Shutdown was requested while the phase was in flight.
    Stopped(RunResult),
}

impl ApplicationHost {
    /// Run `work` as its own task and race it against the shutdown signal.
    ///
    /// `beacon` is stopped as soon as the race resolves, before any grace
    /// wait. Once shutdown wins, the host moves to `Stopping` and waits for
    /// the task for at most the remaining shutdown budget. A task that
    /// outlives the budget is abandoned, not aborted.
    pub(super) async fn race_phase<F>(
        &self,
        phase: ApplicationState,
        beacon: Option<&Arc<dyn ServiceBeacon>>,
        work: F,
    ) -> PhaseOutcome
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut handle = tokio::spawn(work);

        let completed = tokio::select! {
            biased;
            _ = self.shutdown.imminent() => None,
            joined = &mut handle => Some(flatten(phase, joined)),
        };

        // Once shutdown has begun the hosting side de-registers the beacon.
        if let Some(beacon) = beacon {
            let deregistering = self.hosting.token().is_cancelled()
                && !self.hosting.deregistration_budget().is_zero();
            if !deregistering {
                self.stop_beacon(beacon).await;
            }
        }
        if let Some(result) = completed {
            return PhaseOutcome::Completed(result);
        }

        self.transition(ApplicationState::Stopping);
        let grace = self.shutdown.remaining_time();
        info!(
            application = %self.id,
            %phase,
            grace = ?grace,
            "Waiting for application to stop"
        );

        let waited = timeout(grace, &mut handle).await;
        let outcome = match waited {
            Ok(joined) => match flatten(phase, joined) {
                Ok(()) => RunResult::ok(ApplicationState::Stopped),
                Err(error) if error.is_cancellation() && self.shutdown.is_triggered() => {
                    RunResult::ok(ApplicationState::Stopped)
                }
                Err(error) => RunResult::failed(ApplicationState::CrashedDuringStopping, error),
            },
            Err(_) => {
                warn!(
                    application = %self.id,
                    %phase,
                    grace = ?grace,
                    "Application did not stop in time; abandoning the {} task",
                    phase
                );
                self.orphans.lock().push(handle);
                RunResult::ok(ApplicationState::StoppedForcibly)
            }
        };

        PhaseOutcome::Stopped(outcome)
    }
}

fn flatten(
    phase: ApplicationState,
    joined: Result<anyhow::Result<()>, JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(AppError::new(error)),
        Err(join_error) => Err(AppError::new(anyhow::anyhow!(
            "{} task failed: {}",
            phase,
            join_error
        ))),
    }
}
