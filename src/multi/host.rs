use crate::application::{Application, ApplicationId};
use crate::config::HostConfig;
use crate::environment::{DisposeOnce, Environment, EnvironmentFactory, ScopedEnvironment, SetupContext};
use crate::error::{AppError, HostError, Result};
use crate::host::{ApplicationHost, ApplicationHostBuilder};
use crate::observe::{StateBroadcaster, StateSubscription};
use crate::shutdown::{signals, ApplicationShutdown};
use crate::state::{ApplicationState, RunResult};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of an aggregator run: its own terminal state plus the result of
/// every application that was launched.
#[derive(Debug, Clone)]
pub struct MultiRunResult {
    pub state: ApplicationState,
    pub error: Option<AppError>,
    pub applications: BTreeMap<ApplicationId, RunResult>,
}

impl MultiRunResult {
    fn new(state: ApplicationState, error: Option<AppError>) -> Self {
        Self {
            state,
            error,
            applications: BTreeMap::new(),
        }
    }

    /// Fail only on an aggregator-level error. Per-application failures are
    /// left in [`applications`](Self::applications).
    pub fn ensure_success(&self) -> Result<()> {
        match &self.error {
            Some(error) => Err(HostError::Application {
                state: self.state,
                source: error.clone(),
            }),
            None => Ok(()),
        }
    }
}

struct Registration {
    application: Arc<dyn Application>,
    host: Option<Arc<ApplicationHost>>,
}

/// Runs several applications against one shared environment.
///
/// Each application gets its own [`ApplicationHost`] with its own shutdown
/// handle. The shared environment is built once on start and disposed once
/// every launched application has stopped.
pub struct MultiHost {
    config: HostConfig,
    factory: Arc<dyn EnvironmentFactory>,
    shutdown: Arc<ApplicationShutdown>,
    cancellations: Vec<CancellationToken>,
    stop_requested: CancellationToken,

    launched: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    shared: Mutex<Option<Arc<DisposeOnce>>>,
    setup_failure: Mutex<Option<MultiRunResult>>,
    applications: Mutex<BTreeMap<ApplicationId, Registration>>,

    states: StateBroadcaster,
    result: OnceCell<MultiRunResult>,
}

/// Builder for [`MultiHost`].
pub struct MultiHostBuilder {
    factory: Arc<dyn EnvironmentFactory>,
    config: HostConfig,
    cancellations: Vec<CancellationToken>,
    applications: Vec<(ApplicationId, Arc<dyn Application>)>,
}

impl MultiHostBuilder {
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn listen_os_signals(mut self, enabled: bool) -> Self {
        self.config.shutdown.listen_os_signals = enabled;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellations.push(token);
        self
    }

    pub fn application<A: Application>(mut self, id: ApplicationId, application: A) -> Self {
        self.applications.push((id, Arc::new(application)));
        self
    }

    pub fn build(self) -> Arc<MultiHost> {
        let applications = self
            .applications
            .into_iter()
            .map(|(id, application)| {
                (
                    id,
                    Registration {
                        application,
                        host: None,
                    },
                )
            })
            .collect();

        Arc::new(MultiHost {
            shutdown: Arc::new(ApplicationShutdown::new(self.config.shutdown.timeout())),
            config: self.config,
            factory: self.factory,
            cancellations: self.cancellations,
            stop_requested: CancellationToken::new(),
            launched: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            shared: Mutex::new(None),
            setup_failure: Mutex::new(None),
            applications: Mutex::new(applications),
            states: StateBroadcaster::new(),
            result: OnceCell::new(),
        })
    }
}

impl MultiHost {
    pub fn builder<F: EnvironmentFactory>(factory: F) -> MultiHostBuilder {
        MultiHostBuilder {
            factory: Arc::new(factory),
            config: HostConfig::default(),
            cancellations: Vec::new(),
            applications: Vec::new(),
        }
    }

    /// Aggregator-level state.
    pub fn state(&self) -> ApplicationState {
        self.states.current()
    }

    pub fn subscribe(&self) -> StateSubscription {
        self.states.subscribe()
    }

    /// Registered application identifiers, in order.
    pub fn applications(&self) -> Vec<ApplicationId> {
        self.applications.lock().keys().cloned().collect()
    }

    /// State of one application; `None` if it is not registered.
    pub fn application_state(&self, id: &ApplicationId) -> Option<ApplicationState> {
        let applications = self.applications.lock();
        let registration = applications.get(id)?;
        Some(
            registration
                .host
                .as_ref()
                .map(|host| host.state())
                .unwrap_or(ApplicationState::NotInitialized),
        )
    }

    /// Register an application. Once the aggregator is running the
    /// application is launched right away.
    pub fn add_application<A: Application>(&self, id: ApplicationId, application: A) -> Result<()> {
        {
            let mut applications = self.applications.lock();
            if applications.contains_key(&id) {
                return Err(HostError::DuplicateApplication { id: id.to_string() });
            }
            applications.insert(
                id.clone(),
                Registration {
                    application: Arc::new(application),
                    host: None,
                },
            );
        }
        info!(application = %id, "Application registered");

        if self.is_accepting() {
            match self.launch_application(&id) {
                Ok(_) => {}
                Err(_) if self.stop_requested.is_cancelled() => {
                    info!(application = %id, "Aggregator is stopping; application not launched");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Launch a registered application and wait until it is running.
    ///
    /// An application that already reached a terminal state is launched
    /// again on a fresh host.
    pub async fn start_application(&self, id: &ApplicationId) -> Result<()> {
        if !self.is_accepting() {
            return Err(HostError::system("Aggregator is not running"));
        }

        let host = self.launch_application(id)?;
        let mut subscription = host.subscribe();
        if subscription.wait_for(ApplicationState::Running).await {
            return Ok(());
        }
        host.stop(true).await.map(|_| ())
    }

    /// Stop one application and return its result.
    pub async fn stop_application(&self, id: &ApplicationId, ensure_success: bool) -> Result<RunResult> {
        let host = {
            let applications = self.applications.lock();
            let registration = applications
                .get(id)
                .ok_or_else(|| HostError::UnknownApplication { id: id.to_string() })?;
            registration.host.clone()
        };

        match host {
            Some(host) => host.stop(ensure_success).await,
            None => Ok(RunResult::ok(ApplicationState::NotInitialized)),
        }
    }

    /// Build the shared environment and launch every registered application.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.boot().await? {
            Some(result) => result.ensure_success(),
            None => Ok(()),
        }
    }

    /// Start, wait for a stop request, then stop everything.
    pub async fn run(self: &Arc<Self>) -> Result<MultiRunResult> {
        if let Some(result) = self.boot().await? {
            return Ok(result);
        }
        self.stop_requested.cancelled().await;
        Ok(self.finish().await)
    }

    /// Stop every application concurrently, then dispose the shared
    /// environment.
    pub async fn stop(&self) -> Result<MultiRunResult> {
        if !self.launched.load(Ordering::Acquire) {
            return Ok(MultiRunResult::new(ApplicationState::NotInitialized, None));
        }
        info!("Aggregator stop requested");
        Ok(self.finish().await)
    }

    fn is_accepting(&self) -> bool {
        self.shared.lock().is_some() && !self.stop_requested.is_cancelled()
    }

    /// Returns the terminal result when the shared environment fails to build.
    async fn boot(self: &Arc<Self>) -> Result<Option<MultiRunResult>> {
        if self.launched.swap(true, Ordering::AcqRel) {
            return Err(HostError::AlreadyLaunched);
        }
        let lifecycle = self.lifecycle.lock().await;

        self.listen();
        self.transition(ApplicationState::EnvironmentSetup);

        let context = SetupContext {
            id: ApplicationId::new(
                self.config.application.name.clone(),
                self.config.application.instance.clone(),
            ),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        };

        let environment = match self.factory.create(context).await {
            Ok(environment) => environment,
            Err(e) => {
                error!("Failed to set up shared environment: {:#}", e);
                *self.setup_failure.lock() = Some(MultiRunResult::new(
                    ApplicationState::CrashedDuringEnvironmentSetup,
                    Some(AppError::new(e)),
                ));
                drop(lifecycle);
                return Ok(Some(self.finish().await));
            }
        };
        *self.shared.lock() = Some(Arc::new(DisposeOnce::new(environment)));

        if self.stop_requested.is_cancelled() {
            return Ok(None);
        }

        for id in self.applications() {
            if let Err(e) = self.launch_application(&id) {
                warn!(application = %id, "Failed to launch application: {}", e);
            }
        }
        Ok(None)
    }

    /// Finish on the first stop source, from a background listener.
    fn listen(self: &Arc<Self>) {
        let mut sources = self.cancellations.clone();
        sources.push(self.stop_requested.clone());
        let listen_os_signals = self.config.shutdown.listen_os_signals;
        let host = Arc::clone(self);

        tokio::spawn(async move {
            let os_signal = async {
                if !listen_os_signals {
                    return futures::future::pending::<()>().await;
                }
                match signals::wait_for_shutdown_signal().await {
                    Ok(name) => info!("Received {} signal", name),
                    Err(e) => {
                        warn!("Failed to register OS signal handlers: {}", e);
                        futures::future::pending::<()>().await
                    }
                }
            };

            tokio::select! {
                _ = signals::first_of(sources) => {}
                _ = os_signal => {}
            }
            host.finish().await;
        });
    }

    fn launch_application(&self, id: &ApplicationId) -> Result<Arc<ApplicationHost>> {
        let shared = self
            .shared
            .lock()
            .as_ref()
            .map(|shared| Arc::clone(shared.environment()))
            .ok_or_else(|| HostError::system("Shared environment is not ready"))?;

        // Checked under the registry lock so `finish` either sees this host
        // in its snapshot or this launch sees the stop request.
        let mut applications = self.applications.lock();
        if self.stop_requested.is_cancelled() {
            return Err(HostError::system("Aggregator is stopping"));
        }
        let registration = applications
            .get_mut(id)
            .ok_or_else(|| HostError::UnknownApplication { id: id.to_string() })?;
        // A host runs once; a finished application is relaunched on a new one.
        if let Some(host) = &registration.host {
            if !host.state().is_terminal() {
                return Err(HostError::AlreadyLaunched);
            }
        }

        let factory = move |context: SetupContext| {
            let shared = Arc::clone(&shared);
            async move {
                let scoped: Arc<dyn Environment> =
                    Arc::new(ScopedEnvironment::new(shared, context.shutdown));
                Ok::<_, anyhow::Error>(scoped)
            }
        };
        let host = ApplicationHostBuilder::new(Arc::clone(&registration.application), Arc::new(factory))
            .config(self.config.clone())
            .id(id.clone())
            .listen_os_signals(false)
            .build();
        host.spawn()?;
        registration.host = Some(Arc::clone(&host));

        if self.states.current() != ApplicationState::Running {
            self.transition(ApplicationState::Running);
        }
        Ok(host)
    }

    async fn finish(&self) -> MultiRunResult {
        self.result
            .get_or_init(|| async {
                self.stop_requested.cancel();
                let _lifecycle = self.lifecycle.lock().await;

                let failure = self.setup_failure.lock().take();
                if let Some(result) = failure {
                    self.states.publish(result.state, result.error.as_ref());
                    return result;
                }

                let hosts: Vec<(ApplicationId, Arc<ApplicationHost>)> = {
                    let applications = self.applications.lock();
                    self.transition(ApplicationState::Stopping);
                    applications
                        .iter()
                        .filter_map(|(id, registration)| {
                            registration.host.clone().map(|host| (id.clone(), host))
                        })
                        .collect()
                };
                self.shutdown.initiate(self.shutdown.initial_timeout());

                let stops = hosts.iter().map(|(id, host)| async move {
                    let result = match host.stop(false).await {
                        Ok(result) => result,
                        Err(e) => RunResult::failed(
                            ApplicationState::CrashedDuringStopping,
                            AppError::new(anyhow::Error::new(e)),
                        ),
                    };
                    (id.clone(), result)
                });
                let applications: BTreeMap<_, _> = join_all(stops).await.into_iter().collect();

                let shared = self.shared.lock().clone();
                let mut result = MultiRunResult::new(ApplicationState::Exited, None);
                if let Some(shared) = shared {
                    if let Err(e) = shared.dispose().await {
                        error!("Failed to dispose shared environment: {:#}", e);
                        result = MultiRunResult::new(
                            ApplicationState::CrashedDuringStopping,
                            Some(AppError::new(e)),
                        );
                    }
                }
                result.applications = applications;

                info!(
                    state = %result.state,
                    applications = result.applications.len(),
                    "Aggregator finished"
                );
                self.states.publish(result.state, result.error.as_ref());
                result
            })
            .await
            .clone()
    }

    fn transition(&self, state: ApplicationState) {
        if self.states.publish(state, None) {
            info!(%state, "Aggregator state changed");
        }
    }
}
