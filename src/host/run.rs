use super::controller::ApplicationHost;
use super::phase::PhaseOutcome;
use crate::discovery::ServiceBeacon;
use crate::environment::{DisposeOnce, Environment, SetupContext};
use crate::error::{AppError, HostError, Result};
use crate::state::{ApplicationState, RunResult};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

impl ApplicationHost {
    /// Run the application to completion.
    ///
    /// Application failures never surface as `Err`; they are captured in the
    /// returned [`RunResult`]. The only error is calling `run` twice.
    pub async fn run(&self) -> Result<RunResult> {
        self.launch()?;
        Ok(self.execute().await)
    }

    /// Claim the single launch and start listening for stop requests.
    pub(super) fn launch(&self) -> Result<()> {
        if self.launched.swap(true, Ordering::AcqRel) {
            return Err(HostError::AlreadyLaunched);
        }

        let listener = self.hosting.arm(self.listen_os_signals);
        *self.listener.lock() = listener;
        Ok(())
    }

    pub(super) async fn execute(&self) -> RunResult {
        info!(application = %self.id, "Starting application host");

        let result = match self.setup_environment().await {
            Ok(environment) => {
                let environment = DisposeOnce::new(environment);
                let result = self.drive(environment.environment()).await;
                self.dispose(&environment).await;
                result
            }
            Err(result) => result,
        };

        self.disarm();
        self.finish(result)
    }

    async fn setup_environment(&self) -> std::result::Result<Arc<dyn Environment>, RunResult> {
        self.transition(ApplicationState::EnvironmentSetup);

        let context = SetupContext {
            id: self.id.clone(),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        };

        match self.factory.create(context).await {
            Ok(environment) => {
                self.hosting
                    .attach_discovery(environment.beacon(), environment.locator());
                Ok(environment)
            }
            Err(e) => {
                error!(application = %self.id, "Failed to set up environment: {:#}", e);
                Err(RunResult::failed(
                    ApplicationState::CrashedDuringEnvironmentSetup,
                    AppError::new(e),
                ))
            }
        }
    }

    /// Warmup, initialization and running against a built environment.
    async fn drive(&self, environment: &Arc<dyn Environment>) -> RunResult {
        if let Err(e) = self.warmup(environment).await {
            error!(application = %self.id, "Environment warmup failed: {:#}", e);
            return RunResult::failed(
                ApplicationState::CrashedDuringEnvironmentWarmup,
                AppError::new(e),
            );
        }

        self.transition(ApplicationState::Initializing);
        let application = Arc::clone(&self.application);
        let phase_environment = Arc::clone(environment);
        let outcome = self
            .race_phase(ApplicationState::Initializing, None, async move {
                application.initialize(phase_environment).await
            })
            .await;

        match outcome {
            PhaseOutcome::Completed(Ok(())) => self.transition(ApplicationState::Initialized),
            PhaseOutcome::Completed(Err(error)) => {
                return RunResult::failed(ApplicationState::CrashedDuringInitialization, error);
            }
            PhaseOutcome::Stopped(result) => return result,
        }

        self.transition(ApplicationState::Running);
        let beacon = match environment.beacon() {
            Some(beacon) => self.start_beacon(beacon).await,
            None => None,
        };

        let application = Arc::clone(&self.application);
        let phase_environment = Arc::clone(environment);
        let outcome = self
            .race_phase(ApplicationState::Running, beacon.as_ref(), async move {
                application.run(phase_environment).await
            })
            .await;

        match outcome {
            PhaseOutcome::Completed(Ok(())) => RunResult::ok(ApplicationState::Exited),
            PhaseOutcome::Completed(Err(error)) => {
                RunResult::failed(ApplicationState::CrashedDuringRunning, error)
            }
            PhaseOutcome::Stopped(result) => result,
        }
    }

    /// Register with discovery unless shutdown has already begun. Returns the
    /// beacon the running phase is responsible for stopping.
    async fn start_beacon(&self, beacon: Arc<dyn ServiceBeacon>) -> Option<Arc<dyn ServiceBeacon>> {
        if self.hosting.token().is_cancelled() {
            debug!(application = %self.id, "Shutdown under way; not starting service beacon");
            return None;
        }

        if let Err(e) = beacon.start().await {
            warn!(application = %self.id, "Failed to start service beacon: {:#}", e);
        }

        // De-registration may have run while `start` was in flight.
        if self.hosting.token().is_cancelled() {
            self.stop_beacon(&beacon).await;
            return None;
        }
        Some(beacon)
    }

    /// Stop the beacon, bounded by the beacon timeout.
    pub(super) async fn stop_beacon(&self, beacon: &Arc<dyn ServiceBeacon>) {
        let limit = self.config.shutdown.beacon_timeout();
        match timeout(limit, beacon.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(application = %self.id, "Failed to stop service beacon: {:#}", e)
            }
            Err(_) => warn!(
                application = %self.id,
                timeout = ?limit,
                "Service beacon did not stop in time"
            ),
        }
    }

    async fn warmup(&self, environment: &Arc<dyn Environment>) -> anyhow::Result<()> {
        self.transition(ApplicationState::EnvironmentWarmup);
        self.log_environment_facts(environment);

        environment.warmup().await?;

        for (index, hook) in self.hooks.iter().enumerate() {
            debug!(application = %self.id, "Running before-initialize hook #{}", index);
            hook(Arc::clone(environment)).await?;
        }

        Ok(())
    }

    fn log_environment_facts(&self, environment: &Arc<dyn Environment>) {
        info!(
            application = %self.id,
            environment = %self.config.application.environment,
            pid = std::process::id(),
            started_at = %chrono::Utc::now().to_rfc3339(),
            shutdown_timeout = ?self.config.shutdown.timeout(),
            beacon_timeout = ?self.config.shutdown.beacon_timeout(),
            "Application environment ready"
        );
        for (key, value) in environment.describe() {
            info!(application = %self.id, "{} = {}", key, value);
        }
    }

    /// Release the application and the environment. Failures are logged only.
    async fn dispose(&self, environment: &DisposeOnce) {
        if let Err(e) = self.application.dispose().await {
            error!(application = %self.id, "Failed to dispose application: {:#}", e);
        }
        if let Err(e) = environment.dispose().await {
            error!(application = %self.id, "Failed to dispose environment: {:#}", e);
        }
    }

    /// Stop listening for stop requests once the run is over, unless the
    /// shutdown procedure is already under way.
    fn disarm(&self) {
        if let Some(listener) = self.listener.lock().take() {
            if !self.hosting.token().is_cancelled() {
                listener.abort();
            }
        }
    }

    pub(super) fn transition(&self, state: ApplicationState) {
        if self.states.publish(state, None) {
            info!(application = %self.id, %state, "Application state changed");
        }
    }

    fn finish(&self, result: RunResult) -> RunResult {
        match &result.error {
            Some(error) => error!(
                application = %self.id,
                state = %result.state,
                "Application host finished: {:#}",
                error.inner()
            ),
            None => info!(
                application = %self.id,
                state = %result.state,
                "Application host finished"
            ),
        }

        self.states.publish(result.state, result.error.as_ref());
        self.result.send_replace(Some(result.clone()));
        result
    }
}
