use super::builder::BeforeInitializeHook;
use crate::application::{Application, ApplicationId};
use crate::config::HostConfig;
use crate::environment::EnvironmentFactory;
use crate::error::{HostError, Result};
use crate::observe::{StateBroadcaster, StateSubscription};
use crate::shutdown::{ApplicationShutdown, HostingShutdown};
use crate::state::{ApplicationState, RunResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Drives one application through setup, warmup, initialization, running
/// and shutdown, producing a single [`RunResult`].
///
/// A host runs at most once. Share it through the `Arc` returned by the
/// builder to stop it from another task.
pub struct ApplicationHost {
    pub(super) id: ApplicationId,
    pub(super) config: HostConfig,
    pub(super) application: Arc<dyn Application>,
    pub(super) factory: Arc<dyn EnvironmentFactory>,
    pub(super) hooks: Vec<BeforeInitializeHook>,

    // Shutdown wiring
    pub(super) shutdown: Arc<ApplicationShutdown>,
    pub(super) hosting: Arc<HostingShutdown>,
    pub(super) stop_token: CancellationToken,
    pub(super) listen_os_signals: bool,
    pub(super) listener: Mutex<Option<JoinHandle<()>>>,

    // Lifecycle management
    pub(super) launched: AtomicBool,
    pub(super) states: StateBroadcaster,
    pub(super) result: watch::Sender<Option<RunResult>>,
    pub(super) orphans: Mutex<Vec<JoinHandle<anyhow::Result<()>>>>,
}

impl ApplicationHost {
    pub fn id(&self) -> &ApplicationId {
        &self.id
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ApplicationState {
        self.states.current()
    }

    /// Subscribe to state transitions, starting with the current state.
    pub fn subscribe(&self) -> StateSubscription {
        self.states.subscribe()
    }

    /// Shutdown handle the hosted application observes.
    pub fn shutdown(&self) -> &Arc<ApplicationShutdown> {
        &self.shutdown
    }

    /// Number of abandoned phase tasks that are still running.
    pub fn orphaned_phases(&self) -> usize {
        let mut orphans = self.orphans.lock();
        orphans.retain(|orphan| !orphan.is_finished());
        orphans.len()
    }

    /// Launch the host in the background and return once `state_to_await`
    /// (default [`ApplicationState::Running`]) is reached or the run ends,
    /// whichever happens first. Only a run that already ended with an error
    /// makes this fail.
    pub async fn start(self: &Arc<Self>, state_to_await: Option<ApplicationState>) -> Result<()> {
        let target = state_to_await.unwrap_or(ApplicationState::Running);
        let mut subscription = self.subscribe();

        let mut worker = self.spawn()?;

        let reached = tokio::select! {
            biased;
            joined = &mut worker => {
                let result = joined.map_err(|e| HostError::system(e.to_string()))?;
                return result.ensure_success();
            }
            reached = subscription.wait_for(target) => reached,
        };

        if reached {
            info!(application = %self.id, state = %target, "Application host started");
            return Ok(());
        }

        // The stream closed before the target state: the run is over.
        let result = worker
            .await
            .map_err(|e| HostError::system(e.to_string()))?;
        result.ensure_success()
    }

    /// Launch the host on its own task without waiting for any state.
    ///
    /// The host counts as launched once this returns, so a following
    /// [`stop`](Self::stop) always reaches the run.
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<RunResult>> {
        self.launch()?;
        let host = Arc::clone(self);
        Ok(tokio::spawn(async move { host.execute().await }))
    }

    /// Request a stop and wait for the run to finish.
    ///
    /// Before launch this returns `NotInitialized` without side effects.
    pub async fn stop(&self, ensure_success: bool) -> Result<RunResult> {
        if !self.launched.load(Ordering::Acquire) {
            return Ok(RunResult::ok(ApplicationState::NotInitialized));
        }

        info!(application = %self.id, "Stop requested");
        self.stop_token.cancel();

        let result = self.wait_for_result().await?;
        if ensure_success {
            result.ensure_success()?;
        }
        Ok(result)
    }

    pub(super) async fn wait_for_result(&self) -> Result<RunResult> {
        let mut receiver = self.result.subscribe();
        let result = receiver
            .wait_for(|result| result.is_some())
            .await
            .map_err(|_| HostError::system("Host result channel closed"))?;
        let result = (*result).clone();
        result.ok_or_else(|| HostError::system("Host finished without a result"))
    }
}
