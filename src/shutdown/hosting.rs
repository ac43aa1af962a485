use super::application::ApplicationShutdown;
use super::signals;
use crate::budget::TimeBudget;
use crate::config::ShutdownConfig;
use crate::discovery::{ServiceBeacon, ServiceLocator};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEREGISTRATION_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEREGISTRATION_SAFETY_MARGIN: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct DiscoveryHandles {
    beacon: Arc<dyn ServiceBeacon>,
    locator: Option<Arc<dyn ServiceLocator>>,
}

/// Host-facing half of the shutdown machinery.
///
/// Merges every external stop source into one hosting-level token. When it
/// fires, the total budget starts, the beacon gets a bounded chance to
/// de-register, and whatever budget is left is handed to the
/// [`ApplicationShutdown`].
#[derive(Debug)]
pub struct HostingShutdown {
    application: Arc<ApplicationShutdown>,
    token: CancellationToken,
    sources: Mutex<Option<Vec<CancellationToken>>>,
    total_timeout: Duration,
    beacon_timeout: Duration,
    wait_for_deregistration: bool,
    discovery: ArcSwapOption<DiscoveryHandles>,
}

impl HostingShutdown {
    pub fn new(
        application: Arc<ApplicationShutdown>,
        config: &ShutdownConfig,
        sources: Vec<CancellationToken>,
    ) -> Self {
        Self {
            application,
            token: CancellationToken::new(),
            sources: Mutex::new(Some(sources)),
            total_timeout: config.timeout(),
            beacon_timeout: config.beacon_timeout(),
            wait_for_deregistration: config.wait_for_beacon_deregistration,
            discovery: ArcSwapOption::empty(),
        }
    }

    /// Hosting-level token; cancelled once any stop source fires.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn application(&self) -> &Arc<ApplicationShutdown> {
        &self.application
    }

    /// Make the environment's discovery handles available to the shutdown
    /// procedure. Without a beacon no de-registration is attempted.
    pub fn attach_discovery(
        &self,
        beacon: Option<Arc<dyn ServiceBeacon>>,
        locator: Option<Arc<dyn ServiceLocator>>,
    ) {
        let handles = beacon.map(|beacon| Arc::new(DiscoveryHandles { beacon, locator }));
        self.discovery.store(handles);
    }

    /// Outer bound for de-registration: `min(beacon timeout, total / 3)`,
    /// zero without a real beacon.
    pub fn deregistration_budget(&self) -> Duration {
        match self.discovery.load().as_deref() {
            Some(handles) if handles.beacon.is_real() => {
                self.beacon_timeout.min(self.total_timeout / 3)
            }
            _ => Duration::ZERO,
        }
    }

    /// Start listening to the stop sources. Only the first call spawns the
    /// listener.
    pub fn arm(self: &Arc<Self>, listen_os_signals: bool) -> Option<JoinHandle<()>> {
        let sources = self.sources.lock().take()?;
        let this = Arc::clone(self);

        Some(tokio::spawn(async move {
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
                _ = signals::first_of(sources) => debug!("Stop requested"),
                _ = os_signal => {}
                _ = this.token.cancelled() => {}
            }

            this.shutdown().await;
        }))
    }

    /// Run the shutdown procedure.
    async fn shutdown(&self) {
        self.token.cancel();

        let budget = TimeBudget::started(self.total_timeout);
        info!(timeout = ?self.total_timeout, "Hosting shutdown triggered");

        let deregistration_budget = self.deregistration_budget();
        let handles = self
            .discovery
            .load_full()
            .filter(|_| !deregistration_budget.is_zero());
        if let Some(handles) = handles {
            let wait = self.wait_for_deregistration
                && handles.beacon.is_real()
                && handles
                    .locator
                    .as_ref()
                    .map(|locator| locator.is_real())
                    .unwrap_or(false)
                && handles.beacon.replica_info().port.is_some();

            let inner_budget = deregistration_budget
                .saturating_sub(DEREGISTRATION_SAFETY_MARGIN.min(deregistration_budget / 10));
            let task = tokio::spawn(deregister(handles, inner_budget, wait));

            match timeout(deregistration_budget, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Beacon de-registration task failed: {}", e),
                Err(_) => warn!(
                    budget = ?deregistration_budget,
                    "Beacon de-registration did not complete in time"
                ),
            }
        }

        self.application.initiate(budget.remaining());
    }
}

async fn deregister(handles: Arc<DiscoveryHandles>, budget: Duration, wait: bool) {
    let budget = TimeBudget::started(budget);

    if let Err(e) = handles.beacon.stop().await {
        warn!("Failed to stop service beacon: {:#}", e);
        return;
    }
    info!("Service beacon stopped");

    if !wait {
        return;
    }

    let Some(locator) = handles.locator.as_ref() else {
        return;
    };

    let replica = handles.beacon.replica_info();
    while !budget.has_expired() {
        match locator
            .locate(&replica.environment, &replica.application)
            .await
        {
            Ok(topology) => {
                let registered = topology
                    .map(|topology| topology.contains(&replica.replica))
                    .unwrap_or(false);
                if !registered {
                    info!(replica = %replica.replica, "Replica is no longer registered");
                    break;
                }
                debug!(replica = %replica.replica, "Replica is still registered");
            }
            Err(e) => warn!("Failed to resolve topology: {:#}", e),
        }
        sleep(DEREGISTRATION_POLL_INTERVAL.min(budget.remaining())).await;
    }

    // Observers may still hold a cached topology.
    sleep(budget.remaining()).await;
}
