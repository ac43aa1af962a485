//! Environment handed to hosted applications.
//!
//! The host treats the environment as opaque: it is produced by an
//! [`EnvironmentFactory`], exposes the shutdown handle and optional discovery
//! handles, and is disposed exactly once when the host reaches a terminal
//! state.

use crate::application::ApplicationId;
use crate::config::HostConfig;
use crate::discovery::{ServiceBeacon, ServiceLocator};
use crate::shutdown::ApplicationShutdown;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything the factory needs to assemble an environment.
#[derive(Debug, Clone)]
pub struct SetupContext {
    pub id: ApplicationId,
    pub config: HostConfig,
    pub shutdown: Arc<ApplicationShutdown>,
}

#[async_trait]
pub trait Environment: Send + Sync + 'static {
    /// Shutdown handle observed by the hosted application.
    fn shutdown(&self) -> &Arc<ApplicationShutdown>;

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown().token()
    }

    /// Current estimate of the time left for a graceful shutdown.
    fn shutdown_timeout(&self) -> Duration {
        self.shutdown().remaining_time()
    }

    fn beacon(&self) -> Option<Arc<dyn ServiceBeacon>> {
        None
    }

    fn locator(&self) -> Option<Arc<dyn ServiceLocator>> {
        None
    }

    /// Facts logged during warmup.
    fn describe(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Pre-touch clients before the application initializes.
    async fn warmup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait EnvironmentFactory: Send + Sync + 'static {
    async fn create(&self, context: SetupContext) -> anyhow::Result<Arc<dyn Environment>>;
}

#[async_trait]
impl<F, Fut> EnvironmentFactory for F
where
    F: Fn(SetupContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Arc<dyn Environment>>> + Send + 'static,
{
    async fn create(&self, context: SetupContext) -> anyhow::Result<Arc<dyn Environment>> {
        (self)(context).await
    }
}

type DisposeHook = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Straightforward environment: shutdown handle, optional discovery handles,
/// descriptive properties and dispose hooks.
pub struct BasicEnvironment {
    shutdown: Arc<ApplicationShutdown>,
    beacon: Option<Arc<dyn ServiceBeacon>>,
    locator: Option<Arc<dyn ServiceLocator>>,
    properties: Vec<(String, String)>,
    dispose_hooks: Vec<DisposeHook>,
}

impl BasicEnvironment {
    pub fn new(shutdown: Arc<ApplicationShutdown>) -> Self {
        Self {
            shutdown,
            beacon: None,
            locator: None,
            properties: Vec::new(),
            dispose_hooks: Vec::new(),
        }
    }

    /// Environment describing the application in `context`.
    pub fn from_context(context: &SetupContext) -> Self {
        Self::new(Arc::clone(&context.shutdown))
            .with_property("environment", &context.config.application.environment)
            .with_property("application", &context.id.application)
            .with_property("instance", &context.id.instance)
    }

    pub fn with_beacon(mut self, beacon: Arc<dyn ServiceBeacon>) -> Self {
        self.beacon = Some(beacon);
        self
    }

    pub fn with_locator(mut self, locator: Arc<dyn ServiceLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    pub fn on_dispose<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispose_hooks.push(Box::new(hook));
        self
    }
}

#[async_trait]
impl Environment for BasicEnvironment {
    fn shutdown(&self) -> &Arc<ApplicationShutdown> {
        &self.shutdown
    }

    fn beacon(&self) -> Option<Arc<dyn ServiceBeacon>> {
        self.beacon.clone()
    }

    fn locator(&self) -> Option<Arc<dyn ServiceLocator>> {
        self.locator.clone()
    }

    fn describe(&self) -> Vec<(String, String)> {
        self.properties.clone()
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        // Run every hook even if one fails; report the first failure.
        let mut first_error = None;
        for hook in &self.dispose_hooks {
            if let Err(e) = hook() {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Per-application view over a shared environment.
///
/// Exposes the application's own shutdown handle and leaves discovery and
/// disposal to whoever owns the shared environment.
pub struct ScopedEnvironment {
    shared: Arc<dyn Environment>,
    shutdown: Arc<ApplicationShutdown>,
}

impl ScopedEnvironment {
    pub fn new(shared: Arc<dyn Environment>, shutdown: Arc<ApplicationShutdown>) -> Self {
        Self { shared, shutdown }
    }

    pub fn shared(&self) -> &Arc<dyn Environment> {
        &self.shared
    }
}

#[async_trait]
impl Environment for ScopedEnvironment {
    fn shutdown(&self) -> &Arc<ApplicationShutdown> {
        &self.shutdown
    }

    fn describe(&self) -> Vec<(String, String)> {
        self.shared.describe()
    }
}

/// Disposes an environment at most once.
pub struct DisposeOnce {
    environment: Arc<dyn Environment>,
    disposed: AtomicBool,
}

impl DisposeOnce {
    pub fn new(environment: Arc<dyn Environment>) -> Self {
        Self {
            environment,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.environment
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Dispose the environment. Later calls are no-ops returning `Ok(())`.
    pub async fn dispose(&self) -> anyhow::Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.environment.dispose().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn context() -> SetupContext {
        let config = HostConfig::default();
        SetupContext {
            id: ApplicationId::new("orders", "orders-1"),
            shutdown: Arc::new(ApplicationShutdown::new(config.shutdown.timeout())),
            config,
        }
    }

    #[tokio::test]
    async fn test_closure_factory() {
        let factory = |context: SetupContext| async move {
            let environment: Arc<dyn Environment> =
                Arc::new(BasicEnvironment::from_context(&context));
            Ok::<_, anyhow::Error>(environment)
        };

        let environment = factory.create(context()).await.unwrap();
        let facts = environment.describe();
        assert!(facts.contains(&("application".to_string(), "orders".to_string())));
        assert!(facts.contains(&("instance".to_string(), "orders-1".to_string())));
        assert_eq!(environment.shutdown_timeout(), Duration::from_secs(5));
        assert!(environment.beacon().is_none());
    }

    #[tokio::test]
    async fn test_dispose_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let environment = BasicEnvironment::from_context(&context()).on_dispose(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let guard = DisposeOnce::new(Arc::new(environment));
        assert!(guard.dispose().await.is_ok());
        assert!(guard.dispose().await.is_ok());
        assert!(guard.is_disposed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_runs_every_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let environment = BasicEnvironment::from_context(&context())
            .on_dispose(|| anyhow::bail!("metrics flush failed"))
            .on_dispose(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let error = environment.dispose().await.unwrap_err();
        assert_eq!(error.to_string(), "metrics flush failed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scoped_environment_uses_own_shutdown() {
        let shared: Arc<dyn Environment> = Arc::new(BasicEnvironment::from_context(&context()));
        let own = Arc::new(ApplicationShutdown::new(Duration::from_secs(1)));
        let scoped = ScopedEnvironment::new(Arc::clone(&shared), Arc::clone(&own));

        own.initiate(Duration::from_secs(1));
        own.cancelled().await;

        assert!(scoped.shutdown_token().is_cancelled());
        assert!(!shared.shutdown_token().is_cancelled());
        assert_eq!(scoped.describe(), shared.describe());
    }
}
