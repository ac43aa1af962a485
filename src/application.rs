use crate::environment::Environment;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifies a hosted application: name plus instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId {
    pub application: String,
    pub instance: String,
}

impl ApplicationId {
    pub fn new<A: Into<String>, I: Into<String>>(application: A, instance: I) -> Self {
        Self {
            application: application.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.instance)
    }
}

/// Application driven by an [`ApplicationHost`](crate::ApplicationHost).
///
/// Both entry points run as independent tasks and are expected to return
/// promptly once the environment's shutdown token is cancelled. Returning
/// [`HostError::Cancelled`](crate::HostError::Cancelled) after observing the
/// token counts as a clean stop.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    async fn initialize(&self, environment: Arc<dyn Environment>) -> anyhow::Result<()> {
        let _ = environment;
        Ok(())
    }

    async fn run(&self, environment: Arc<dyn Environment>) -> anyhow::Result<()>;

    /// Release application resources once the host is terminal.
    async fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_id_display() {
        let id = ApplicationId::new("orders", "orders-1");
        assert_eq!(id.to_string(), "orders/orders-1");
    }

    #[test]
    fn test_application_id_ordering() {
        let mut ids = vec![
            ApplicationId::new("payments", "a"),
            ApplicationId::new("orders", "b"),
            ApplicationId::new("orders", "a"),
        ];
        ids.sort();

        assert_eq!(ids[0], ApplicationId::new("orders", "a"));
        assert_eq!(ids[2], ApplicationId::new("payments", "a"));
    }
}
