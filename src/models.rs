//! Desired-state payloads and status report shapes exchanged with the
//! control plane.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Container label naming the application that owns a container.
///
/// Every container the agent creates carries it; the container GC only ever
/// considers containers that have this label.
pub const APPLICATION_LABEL: &str = "io.fleet-agent.application";

/// Container label naming the service within the owning application.
pub const SERVICE_LABEL: &str = "io.fleet-agent.service";

/// Container label naming the release a container was created from.
pub const RELEASE_LABEL: &str = "io.fleet-agent.release";

/// Full desired-state payload pushed to the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Agent version the control plane wants the device to run.
    #[serde(default)]
    pub desired_agent_version: String,
    /// Applications the device should be running.
    #[serde(default)]
    pub applications: Vec<FullBundledApplication>,
}

/// One application together with its latest release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullBundledApplication {
    /// Application identity.
    pub application: Application,
    /// Release to converge to. `None` means the application has no release yet.
    #[serde(default)]
    pub latest_release: Option<Release>,
}

/// Application identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Stable application ID; the registry and container labels key on it.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
}

/// A versioned set of services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Release ID.
    pub id: String,
    /// Services keyed by service name.
    #[serde(default)]
    pub config: BTreeMap<String, Service>,
}

/// Specification of one containerized service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Image reference.
    pub image: String,
    /// Command override. Empty means the image default.
    #[serde(default)]
    pub command: Vec<String>,
    /// Entrypoint override. Empty means the image default.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// `KEY=value` environment entries.
    #[serde(default)]
    pub environment: Vec<String>,
    /// Extra container labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Docker network mode (`host`, `bridge`, ...).
    #[serde(default)]
    pub network_mode: Option<String>,
    /// Run the container privileged.
    #[serde(default)]
    pub privileged: bool,
    /// Restart policy name (`always`, `unless-stopped`, `on-failure`, `no`).
    #[serde(default)]
    pub restart: Option<String>,
}

/// Lifecycle state of a service on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Nothing observed yet.
    #[default]
    Unknown,
    /// Image pull in progress.
    PullingImage,
    /// Container creation in progress.
    CreatingContainer,
    /// A container from an older release is being torn down.
    StoppingPreviousContainer,
    /// Container is running.
    Running,
    /// Container exited and could not be restarted.
    Exited,
    /// An admission validator refused the service.
    Rejected,
}

/// Body of a service status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDeviceServiceStatusRequest {
    /// Release the service is currently running.
    pub current_release_id: String,
}

/// Body of a service state report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDeviceServiceStateRequest {
    /// New state.
    pub state: ServiceState,
    /// Error detail for failure states, empty otherwise.
    #[serde(default)]
    pub error_message: String,
}
