use crate::state::ApplicationState;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Host has already been launched; each instance runs only once")]
    AlreadyLaunched,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Application ended in state {state}: {source}")]
    Application {
        state: ApplicationState,
        #[source]
        source: AppError,
    },

    #[error("Application {id} is already registered")]
    DuplicateApplication { id: String },

    #[error("Application {id} is not registered")]
    UnknownApplication { id: String },

    #[error("System error: {message}")]
    System { message: String },
}

impl HostError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Whether `error` is the cancellation-shaped error hosted code returns
    /// after observing the shutdown signal.
    pub fn is_cancellation(error: &anyhow::Error) -> bool {
        matches!(error.downcast_ref::<HostError>(), Some(HostError::Cancelled))
    }
}

pub type Result<T> = std::result::Result<T, HostError>;

/// Error captured from hosted code (application entry points, environment
/// factory, hooks).
///
/// Cloning shares the same underlying error, so every copy handed out in a
/// [`RunResult`](crate::RunResult) or a state notification refers to the
/// instance the failing code produced.
#[derive(Clone)]
pub struct AppError(Arc<anyhow::Error>);

impl AppError {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    pub fn ptr_eq(&self, other: &AppError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_cancellation(&self) -> bool {
        HostError::is_cancellation(&self.0)
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(error)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_detection() {
        let cancelled = anyhow::Error::new(HostError::Cancelled);
        assert!(HostError::is_cancellation(&cancelled));

        let other = anyhow::anyhow!("boom");
        assert!(!HostError::is_cancellation(&other));

        let context = anyhow::Error::new(HostError::Cancelled).context("while running");
        assert!(HostError::is_cancellation(&context));
    }

    #[test]
    fn test_app_error_identity() {
        let error = AppError::new(anyhow::anyhow!("boom"));
        let copy = error.clone();
        let other = AppError::new(anyhow::anyhow!("boom"));

        assert!(error.ptr_eq(&copy));
        assert!(!error.ptr_eq(&other));
        assert_eq!(error.to_string(), "boom");
    }
}
