use crate::error::{AppError, HostError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a hosted application, in the order a healthy run
/// walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ApplicationState {
    NotInitialized,
    EnvironmentSetup,
    EnvironmentWarmup,
    Initializing,
    Initialized,
    Running,
    Stopping,
    Stopped,
    StoppedForcibly,
    Exited,
    CrashedDuringEnvironmentSetup,
    CrashedDuringEnvironmentWarmup,
    CrashedDuringInitialization,
    CrashedDuringRunning,
    CrashedDuringStopping,
}

impl ApplicationState {
    /// Terminal states end the state stream; nothing follows them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApplicationState::Stopped
                | ApplicationState::StoppedForcibly
                | ApplicationState::Exited
                | ApplicationState::CrashedDuringEnvironmentSetup
                | ApplicationState::CrashedDuringEnvironmentWarmup
                | ApplicationState::CrashedDuringInitialization
                | ApplicationState::CrashedDuringRunning
                | ApplicationState::CrashedDuringStopping
        )
    }

    pub fn is_crashed(self) -> bool {
        matches!(
            self,
            ApplicationState::CrashedDuringEnvironmentSetup
                | ApplicationState::CrashedDuringEnvironmentWarmup
                | ApplicationState::CrashedDuringInitialization
                | ApplicationState::CrashedDuringRunning
                | ApplicationState::CrashedDuringStopping
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApplicationState::NotInitialized => "not_initialized",
            ApplicationState::EnvironmentSetup => "environment_setup",
            ApplicationState::EnvironmentWarmup => "environment_warmup",
            ApplicationState::Initializing => "initializing",
            ApplicationState::Initialized => "initialized",
            ApplicationState::Running => "running",
            ApplicationState::Stopping => "stopping",
            ApplicationState::Stopped => "stopped",
            ApplicationState::StoppedForcibly => "stopped_forcibly",
            ApplicationState::Exited => "exited",
            ApplicationState::CrashedDuringEnvironmentSetup => "crashed_during_environment_setup",
            ApplicationState::CrashedDuringEnvironmentWarmup => {
                "crashed_during_environment_warmup"
            }
            ApplicationState::CrashedDuringInitialization => "crashed_during_initialization",
            ApplicationState::CrashedDuringRunning => "crashed_during_running",
            ApplicationState::CrashedDuringStopping => "crashed_during_stopping",
        }
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one host run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub state: ApplicationState,
    pub error: Option<AppError>,
}

impl RunResult {
    pub fn new(state: ApplicationState, error: Option<AppError>) -> Self {
        Self { state, error }
    }

    pub fn ok(state: ApplicationState) -> Self {
        Self { state, error: None }
    }

    pub fn failed(state: ApplicationState, error: AppError) -> Self {
        Self {
            state,
            error: Some(error),
        }
    }

    /// Re-raise the captured error, if any.
    pub fn ensure_success(&self) -> Result<(), HostError> {
        match &self.error {
            Some(error) => Err(HostError::Application {
                state: self.state,
                source: error.clone(),
            }),
            None => Ok(()),
        }
    }
}
