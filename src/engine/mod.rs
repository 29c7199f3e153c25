//! Container engine abstraction.
//!
//! The supervisor only talks to containers through [`Engine`]. The
//! production implementation is [`docker::DockerEngine`]; tests provide
//! in-memory engines.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;

use crate::models::Service;

pub mod docker;

/// A container as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instance {
    /// Engine-assigned container ID.
    pub id: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Whether the container is currently running.
    pub running: bool,
}

impl Instance {
    /// Value of `key` in this container's labels, if present.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Label-based container selection.
///
/// A container matches when it carries every key in `keys` (any value) and
/// every `key=value` pair in `key_values`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    keys: BTreeSet<String>,
    key_values: BTreeMap<String, String>,
}

impl LabelFilter {
    /// Require the label `key` to be present.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.keys.insert(key.into());
        self
    }

    /// Require the label `key` to equal `value`.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.key_values.insert(key.into(), value.into());
        self
    }

    /// Whether `labels` satisfy this filter.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.keys.iter().all(|key| labels.contains_key(key))
            && self
                .key_values
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value))
    }

    /// Render as Docker `label` filter expressions (`key` or `key=value`).
    pub fn expressions(&self) -> Vec<String> {
        self.keys
            .iter()
            .cloned()
            .chain(
                self.key_values
                    .iter()
                    .map(|(key, value)| format!("{key}={value}")),
            )
            .collect()
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Command override (empty for the image default).
    pub command: Vec<String>,
    /// Entrypoint override (empty for the image default).
    pub entrypoint: Vec<String>,
    /// `KEY=value` environment entries.
    pub environment: Vec<String>,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Docker network mode.
    pub network_mode: Option<String>,
    /// Run privileged.
    pub privileged: bool,
    /// Restart policy name.
    pub restart: Option<String>,
}

impl ContainerSpec {
    /// Build a spec from a service definition plus ownership labels.
    ///
    /// Ownership labels win over service-provided labels with the same key.
    pub fn from_service(
        service: &Service,
        ownership: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let mut labels: HashMap<String, String> = service
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.extend(ownership);

        Self {
            image: service.image.clone(),
            command: service.command.clone(),
            entrypoint: service.entrypoint.clone(),
            environment: service.environment.clone(),
            labels,
            network_mode: service.network_mode.clone(),
            privileged: service.privileged,
            restart: service.restart.clone(),
        }
    }
}

/// Errors produced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The referenced container or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The registry auth blob could not be decoded.
    #[error("invalid registry auth: {0}")]
    InvalidRegistryAuth(String),
    /// Any other engine API failure.
    #[error("engine operation failed: {0}")]
    Api(String),
}

/// Container engine operations used by the supervisors.
///
/// Cancellation is cooperative: callers race these futures against their
/// shutdown signal and drop them to abort.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Pull `image`, authenticating with the raw `registry_auth` blob when non-empty.
    async fn pull_image(&self, image: &str, registry_auth: &str) -> Result<(), EngineError>;

    /// Create a container named `name` and return its ID.
    async fn create_container(&self, name: &str, spec: &ContainerSpec)
        -> Result<String, EngineError>;

    /// Start a created or stopped container.
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// List containers matching `filter`; `all` includes stopped containers.
    async fn list_containers(
        &self,
        filter: &LabelFilter,
        all: bool,
    ) -> Result<Vec<Instance>, EngineError>;

    /// Stop a container. Stopping an already-stopped container succeeds.
    async fn stop_container(&self, id: &str) -> Result<(), EngineError>;

    /// Remove a container.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
}
