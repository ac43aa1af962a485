pub mod application;
pub mod budget;
pub mod config;
pub mod discovery;
pub mod environment;
pub mod error;
pub mod host;
pub mod multi;
pub mod observe;
pub mod shutdown;
pub mod state;

pub use application::{Application, ApplicationId};
pub use budget::TimeBudget;
pub use config::{ApplicationConfig, HostConfig, ShutdownConfig};
pub use discovery::{NoopBeacon, NoopLocator, ReplicaInfo, ServiceBeacon, ServiceLocator, Topology};
pub use environment::{
    BasicEnvironment, DisposeOnce, Environment, EnvironmentFactory, ScopedEnvironment,
    SetupContext,
};
pub use error::{AppError, HostError, Result};
pub use host::{ApplicationHost, ApplicationHostBuilder, BeforeInitializeHook};
pub use multi::{MultiHost, MultiHostBuilder, MultiRunResult};
pub use observe::{StateBroadcaster, StateEvent, StateSubscription};
pub use shutdown::{ApplicationShutdown, HostingShutdown};
pub use state::{ApplicationState, RunResult};
