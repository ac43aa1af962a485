use super::*;
use crate::application::{Application, ApplicationId};
use crate::environment::{BasicEnvironment, Environment, EnvironmentFactory, SetupContext};
use crate::error::HostError;
use crate::state::ApplicationState;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Runs until its shutdown handle fires, or exits right away.
struct Worker {
    runs: Arc<AtomicUsize>,
    exit_immediately: bool,
}

impl Worker {
    fn new(runs: &Arc<AtomicUsize>) -> Self {
        Self {
            runs: Arc::clone(runs),
            exit_immediately: false,
        }
    }

    fn one_shot(runs: &Arc<AtomicUsize>) -> Self {
        Self {
            runs: Arc::clone(runs),
            exit_immediately: true,
        }
    }
}

#[async_trait]
impl Application for Worker {
    async fn run(&self, environment: Arc<dyn Environment>) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.exit_immediately {
            return Ok(());
        }
        environment.shutdown().cancelled().await;
        Err(HostError::Cancelled.into())
    }
}

fn id(name: &str) -> ApplicationId {
    ApplicationId::new(name, "test")
}

fn shared_factory(disposals: Arc<AtomicUsize>, fail_dispose: bool) -> impl EnvironmentFactory {
    move |context: SetupContext| {
        let disposals = Arc::clone(&disposals);
        async move {
            let environment = BasicEnvironment::from_context(&context)
                .with_property("region", "local")
                .on_dispose(move || {
                    disposals.fetch_add(1, Ordering::SeqCst);
                    if fail_dispose {
                        anyhow::bail!("shared pool did not close");
                    }
                    Ok(())
                });
            Ok::<Arc<dyn Environment>, anyhow::Error>(Arc::new(environment))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_all_applications() {
    let disposals = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let host = MultiHost::builder(shared_factory(Arc::clone(&disposals), false))
        .shutdown_timeout(Duration::from_secs(1))
        .application(id("orders"), Worker::new(&runs))
        .application(id("billing"), Worker::new(&runs))
        .build();
    let subscription = host.subscribe();

    host.start().await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(host.state(), ApplicationState::Running);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(
        host.application_state(&id("orders")),
        Some(ApplicationState::Running)
    );

    let result = host.stop().await.unwrap();

    assert_eq!(result.state, ApplicationState::Exited);
    assert!(result.error.is_none());
    assert_eq!(result.applications.len(), 2);
    for (_, application) in &result.applications {
        assert_eq!(application.state, ApplicationState::Stopped);
    }
    assert_eq!(disposals.load(Ordering::SeqCst), 1);

    let (states, _) = subscription.collect().await;
    assert_eq!(
        states,
        vec![
            ApplicationState::NotInitialized,
            ApplicationState::EnvironmentSetup,
            ApplicationState::Running,
            ApplicationState::Stopping,
            ApplicationState::Exited,
        ]
    );

    // A second stop returns the same result without disposing again.
    let again = host.stop().await.unwrap();
    assert_eq!(again.state, ApplicationState::Exited);
    assert_eq!(disposals.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_does_not_exit_when_applications_finish() {
    let runs = Arc::new(AtomicUsize::new(0));
    let host = MultiHost::builder(shared_factory(Arc::new(AtomicUsize::new(0)), false))
        .application(id("migrate"), Worker::one_shot(&runs))
        .build();

    host.start().await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(
        host.application_state(&id("migrate")),
        Some(ApplicationState::Exited)
    );
    assert_eq!(host.state(), ApplicationState::Running);

    let result = host.stop().await.unwrap();
    assert_eq!(result.state, ApplicationState::Exited);
    assert_eq!(
        result.applications[&id("migrate")].state,
        ApplicationState::Exited
    );
}

#[tokio::test(start_paused = true)]
async fn test_shared_environment_setup_failure() {
    let runs = Arc::new(AtomicUsize::new(0));
    let host = MultiHost::builder(|_context: SetupContext| async move {
        Err::<Arc<dyn Environment>, anyhow::Error>(anyhow::anyhow!("database unreachable"))
    })
    .application(id("orders"), Worker::new(&runs))
    .build();

    match host.start().await {
        Err(HostError::Application { state, .. }) => {
            assert_eq!(state, ApplicationState::CrashedDuringEnvironmentSetup)
        }
        other => panic!("Unexpected start result: {:?}", other),
    }

    assert_eq!(host.state(), ApplicationState::CrashedDuringEnvironmentSetup);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let result = host.stop().await.unwrap();
    assert_eq!(result.state, ApplicationState::CrashedDuringEnvironmentSetup);
    assert!(result.applications.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shared_dispose_failure_keeps_application_results() {
    let disposals = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let host = MultiHost::builder(shared_factory(Arc::clone(&disposals), true))
        .application(id("orders"), Worker::new(&runs))
        .build();

    host.start().await.unwrap();
    let result = host.stop().await.unwrap();

    assert_eq!(result.state, ApplicationState::CrashedDuringStopping);
    assert!(result.ensure_success().is_err());
    assert_eq!(
        result.applications[&id("orders")].state,
        ApplicationState::Stopped
    );
    assert_eq!(disposals.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_add_application_while_running() {
    let runs = Arc::new(AtomicUsize::new(0));
    let host = MultiHost::builder(shared_factory(Arc::new(AtomicUsize::new(0)), false))
        .application(id("orders"), Worker::new(&runs))
        .build();
    host.start().await.unwrap();

    let duplicate = host.add_application(id("orders"), Worker::new(&runs));
    assert!(matches!(
        duplicate,
        Err(HostError::DuplicateApplication { .. })
    ));

    host.add_application(id("reports"), Worker::new(&runs))
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(host.applications(), vec![id("orders"), id("reports")]);
    assert_eq!(
        host.application_state(&id("reports")),
        Some(ApplicationState::Running)
    );

    let result = host.stop().await.unwrap();
    assert_eq!(result.applications.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_and_restart_single_application() {
    let runs = Arc::new(AtomicUsize::new(0));
    let host = MultiHost::builder(shared_factory(Arc::new(AtomicUsize::new(0)), false))
        .application(id("orders"), Worker::new(&runs))
        .application(id("billing"), Worker::new(&runs))
        .build();
    host.start().await.unwrap();
    sleep(Duration::from_millis(10)).await;

    let stopped = host.stop_application(&id("orders"), true).await.unwrap();
    assert_eq!(stopped.state, ApplicationState::Stopped);
    assert_eq!(
        host.application_state(&id("billing")),
        Some(ApplicationState::Running)
    );
    assert_eq!(host.state(), ApplicationState::Running);

    host.start_application(&id("orders")).await.unwrap();
    assert_eq!(
        host.application_state(&id("orders")),
        Some(ApplicationState::Running)
    );
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    assert!(matches!(
        host.start_application(&id("orders")).await,
        Err(HostError::AlreadyLaunched)
    ));
    assert!(matches!(
        host.stop_application(&id("missing"), false).await,
        Err(HostError::UnknownApplication { .. })
    ));

    let result = host.stop().await.unwrap();
    assert_eq!(result.state, ApplicationState::Exited);
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_start() {
    let host = MultiHost::builder(shared_factory(Arc::new(AtomicUsize::new(0)), false)).build();

    let result = host.stop().await.unwrap();

    assert_eq!(result.state, ApplicationState::NotInitialized);
    assert_eq!(host.state(), ApplicationState::NotInitialized);
    assert_eq!(host.application_state(&id("orders")), None);
}

#[tokio::test(start_paused = true)]
async fn test_run_until_cancelled() {
    let token = CancellationToken::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let host = MultiHost::builder(shared_factory(Arc::new(AtomicUsize::new(0)), false))
        .cancellation(token.clone())
        .application(id("orders"), Worker::new(&runs))
        .build();

    let runner = Arc::clone(&host);
    let run = tokio::spawn(async move { runner.run().await });
    sleep(Duration::from_millis(10)).await;
    assert_eq!(host.state(), ApplicationState::Running);
    assert!(matches!(host.start().await, Err(HostError::AlreadyLaunched)));

    token.cancel();
    let result = run.await.unwrap().unwrap();

    assert_eq!(result.state, ApplicationState::Exited);
    assert_eq!(
        result.applications[&id("orders")].state,
        ApplicationState::Stopped
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_applications_added_during_stop_are_not_left_running() {
    let runs = Arc::new(AtomicUsize::new(0));
    let host = MultiHost::builder(shared_factory(Arc::new(AtomicUsize::new(0)), false))
        .shutdown_timeout(Duration::from_secs(1))
        .application(id("orders"), Worker::new(&runs))
        .build();
    host.start().await.unwrap();

    let adders: Vec<_> = (0..32)
        .map(|n| {
            let host = Arc::clone(&host);
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                host.add_application(id(&format!("worker-{}", n)), Worker::new(&runs))
            })
        })
        .collect();
    let result = host.stop().await.unwrap();
    for adder in adders {
        adder.await.unwrap().unwrap();
    }

    assert_eq!(result.state, ApplicationState::Exited);
    for application in host.applications() {
        let state = host.application_state(&application).unwrap();
        if state == ApplicationState::NotInitialized {
            assert!(!result.applications.contains_key(&application));
        } else {
            assert!(state.is_terminal(), "{} left in {}", application, state);
            assert!(result.applications.contains_key(&application));
        }
    }
}
