use super::controller::ApplicationHost;
use crate::application::{Application, ApplicationId};
use crate::config::HostConfig;
use crate::environment::{Environment, EnvironmentFactory};
use crate::observe::StateBroadcaster;
use crate::shutdown::{ApplicationShutdown, HostingShutdown};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Async hook run during warmup with the finished environment.
pub type BeforeInitializeHook =
    Box<dyn Fn(Arc<dyn Environment>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Builder for [`ApplicationHost`].
pub struct ApplicationHostBuilder {
    application: Arc<dyn Application>,
    factory: Arc<dyn EnvironmentFactory>,
    config: HostConfig,
    hooks: Vec<BeforeInitializeHook>,
    cancellations: Vec<CancellationToken>,
}

impl ApplicationHost {
    pub fn builder<A, F>(application: A, factory: F) -> ApplicationHostBuilder
    where
        A: Application,
        F: EnvironmentFactory,
    {
        ApplicationHostBuilder::new(Arc::new(application), Arc::new(factory))
    }
}

impl ApplicationHostBuilder {
    pub fn new(application: Arc<dyn Application>, factory: Arc<dyn EnvironmentFactory>) -> Self {
        Self {
            application,
            factory,
            config: HostConfig::default(),
            hooks: Vec::new(),
            cancellations: Vec::new(),
        }
    }

    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    pub fn id(mut self, id: ApplicationId) -> Self {
        self.config.application.name = id.application;
        self.config.application.instance = id.instance;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn beacon_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown.beacon_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn listen_os_signals(mut self, enabled: bool) -> Self {
        self.config.shutdown.listen_os_signals = enabled;
        self
    }

    /// Add an external stop source. Cancelling any source stops the host.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellations.push(token);
        self
    }

    /// Run `hook` during warmup, after the environment is built and before
    /// the application initializes. This is also where process-wide
    /// providers are installed from the environment, if the caller wants that.
    pub fn before_initialize<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<dyn Environment>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.push(Box::new(move |environment| hook(environment).boxed()));
        self
    }

    pub fn build(self) -> Arc<ApplicationHost> {
        let id = ApplicationId::new(
            self.config.application.name.clone(),
            self.config.application.instance.clone(),
        );
        let shutdown = Arc::new(ApplicationShutdown::new(self.config.shutdown.timeout()));
        let stop_token = CancellationToken::new();

        let mut sources = vec![stop_token.clone()];
        sources.extend(self.cancellations);
        let hosting = Arc::new(HostingShutdown::new(
            Arc::clone(&shutdown),
            &self.config.shutdown,
            sources,
        ));
        let (result, _) = watch::channel(None);

        Arc::new(ApplicationHost {
            id,
            listen_os_signals: self.config.shutdown.listen_os_signals,
            config: self.config,
            application: self.application,
            factory: self.factory,
            hooks: self.hooks,
            shutdown,
            hosting,
            stop_token,
            listener: Mutex::new(None),
            launched: AtomicBool::new(false),
            states: StateBroadcaster::new(),
            result,
            orphans: Mutex::new(Vec::new()),
        })
    }
}
