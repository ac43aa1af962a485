//! Service discovery handles consumed during shutdown.
//!
//! The host never talks to a discovery directory itself. It only asks the
//! environment's beacon to start/stop and, while shutting down, polls the
//! locator until the instance's own entry disappears.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity under which a beacon registers the running instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Environment (zone) the replica is registered in
    pub environment: String,

    /// Application name
    pub application: String,

    /// Replica identifier as published in the directory
    pub replica: String,

    /// Network-reachable port, if the instance listens on one
    pub port: Option<u16>,
}

/// Snapshot of the replicas registered for one application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub replicas: Vec<String>,
}

impl Topology {
    pub fn new<I, S>(replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replicas: replicas.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, replica: &str) -> bool {
        self.replicas.iter().any(|candidate| candidate == replica)
    }
}

/// Registers the running instance in a discovery directory.
#[async_trait]
pub trait ServiceBeacon: Send + Sync + fmt::Debug {
    /// Identity this beacon publishes.
    fn replica_info(&self) -> ReplicaInfo;

    /// Begin publishing the instance.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop publishing the instance.
    async fn stop(&self) -> anyhow::Result<()>;

    /// False for stand-ins that never touch a real directory.
    fn is_real(&self) -> bool {
        true
    }
}

/// Resolves the current topology of an application.
#[async_trait]
pub trait ServiceLocator: Send + Sync + fmt::Debug {
    async fn locate(&self, environment: &str, application: &str) -> anyhow::Result<Option<Topology>>;

    /// False for stand-ins that never touch a real directory.
    fn is_real(&self) -> bool {
        true
    }
}

/// Beacon stand-in used when no directory is configured.
#[derive(Debug, Clone)]
pub struct NoopBeacon {
    replica: ReplicaInfo,
}

impl NoopBeacon {
    pub fn new(replica: ReplicaInfo) -> Self {
        Self { replica }
    }
}

#[async_trait]
impl ServiceBeacon for NoopBeacon {
    fn replica_info(&self) -> ReplicaInfo {
        self.replica.clone()
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_real(&self) -> bool {
        false
    }
}

/// Locator stand-in that never finds anything.
#[derive(Debug, Clone, Default)]
pub struct NoopLocator;

#[async_trait]
impl ServiceLocator for NoopLocator {
    async fn locate(&self, _environment: &str, _application: &str) -> anyhow::Result<Option<Topology>> {
        Ok(None)
    }

    fn is_real(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica() -> ReplicaInfo {
        ReplicaInfo {
            environment: "default".to_string(),
            application: "orders".to_string(),
            replica: "host-1:8080".to_string(),
            port: Some(8080),
        }
    }

    #[test]
    fn test_topology_contains() {
        let topology = Topology::new(["host-1:8080", "host-2:8080"]);
        assert!(topology.contains("host-1:8080"));
        assert!(!topology.contains("host-3:8080"));
    }

    #[tokio::test]
    async fn test_noop_handles_are_not_real() {
        let beacon = NoopBeacon::new(replica());
        assert!(!beacon.is_real());
        assert!(beacon.start().await.is_ok());
        assert!(beacon.stop().await.is_ok());
        assert_eq!(beacon.replica_info(), replica());

        let locator = NoopLocator;
        assert!(!locator.is_real());
        assert!(locator.locate("default", "orders").await.unwrap().is_none());
    }
}
