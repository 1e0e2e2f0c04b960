//! Container runtime collaborator.

use std::collections::BTreeMap;

use {
    anyhow::Result,
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::Serialize,
};

use crate::launch::{LABEL_MANAGED, LABEL_OWNER, LABEL_QUOTA, LaunchSpec};

/// A container as reported by the runtime's listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
}

impl ContainerHandle {
    /// Carries `deskfarm.managed=true`.
    #[must_use]
    pub fn is_managed(&self) -> bool {
        self.labels.get(LABEL_MANAGED).is_some_and(|v| v == "true")
    }

    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.labels.get(LABEL_OWNER).map(String::as_str)
    }

    #[must_use]
    pub fn quota_label(&self) -> Option<&str> {
        self.labels.get(LABEL_QUOTA).map(String::as_str)
    }
}

/// Point-in-time resource usage of one container.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// The runtime refused to create a container because the name is taken.
///
/// Adapters return it inside their `anyhow::Error` so callers can tell a
/// foreign container apart from a failed create.
#[derive(Debug, thiserror::Error)]
#[error("container name already in use: {name}")]
pub struct NameConflict {
    pub name: String,
}

/// The runtime does not know a container by this name.
#[derive(Debug, thiserror::Error)]
#[error("no such container: {name}")]
pub struct ContainerMissing {
    pub name: String,
}

/// Container lifecycle operations.
///
/// Every method is a single runtime call; callers bound them with a timeout.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Human-readable backend name (e.g. "docker", "podman").
    fn backend_name(&self) -> &'static str;

    /// Start a detached container from `spec`.
    async fn create(&self, spec: &LaunchSpec) -> Result<ContainerHandle>;

    /// Every managed container, running or not.
    async fn list(&self) -> Result<Vec<ContainerHandle>>;

    /// Remove a container by name. Removing a missing container succeeds.
    async fn remove(&self, name: &str, force: bool) -> Result<()>;

    async fn stats(&self, name: &str) -> Result<ResourceUsage>;

    /// Host port published for `container_port`, if any. Fails with
    /// [`ContainerMissing`] when the container does not exist.
    async fn host_port(&self, name: &str, container_port: u16) -> Result<Option<u16>>;
}
