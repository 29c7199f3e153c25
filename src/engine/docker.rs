//! Docker-backed [`Engine`] implementation via the bollard API.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine as _;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::debug;

use super::{ContainerSpec, Engine, EngineError, Instance, LabelFilter};

/// Docker engine client.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
    stop_timeout_secs: u32,
}

impl DockerEngine {
    /// Connect to the local Docker daemon (honours `DOCKER_HOST`).
    ///
    /// # Errors
    ///
    /// Returns an error when the client cannot be configured.
    pub fn connect(stop_timeout_secs: u32) -> Result<Self, EngineError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| EngineError::Api(e.to_string()))?;
        Ok(Self {
            docker,
            stop_timeout_secs,
        })
    }

    /// Returns true if the Docker daemon answers a ping.
    pub async fn available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

#[async_trait]
impl Engine for DockerEngine {
    async fn pull_image(&self, image: &str, registry_auth: &str) -> Result<(), EngineError> {
        let credentials = decode_registry_auth(registry_auth)?;
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, credentials);
        while let Some(chunk) = stream.next().await {
            let info = chunk.map_err(|e| map_error(image, e))?;
            if let Some(status) = info.status {
                debug!(image, status = %status, "pull progress");
            }
        }
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, EngineError> {
        let options = Some(CreateContainerOptions {
            name: name.to_owned(),
            platform: None,
        });
        let created = self
            .docker
            .create_container(options, build_container_config(spec))
            .await
            .map_err(|e| map_error(name, e))?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error(id, e))
    }

    async fn list_containers(
        &self,
        filter: &LabelFilter,
        all: bool,
    ) -> Result<Vec<Instance>, EngineError> {
        let options = Some(ListContainersOptions {
            all,
            filters: HashMap::from([("label".to_owned(), filter.expressions())]),
            ..Default::default()
        });

        let containers = self
            .docker
            .list_containers(options)
            .await
            .map_err(|e| EngineError::Api(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                Some(Instance {
                    id,
                    labels: summary.labels.unwrap_or_default(),
                    running: summary.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: i64::from(self.stop_timeout_secs),
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: container already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_error(id, e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_error(id, e))
    }
}

fn map_error(subject: &str, err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(subject.to_owned()),
        other => EngineError::Api(other.to_string()),
    }
}

fn build_container_config(spec: &ContainerSpec) -> ContainerConfig<String> {
    let restart_policy = spec.restart.as_deref().map(|name| RestartPolicy {
        name: Some(match name {
            "always" => RestartPolicyNameEnum::ALWAYS,
            "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
            "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
            _ => RestartPolicyNameEnum::NO,
        }),
        maximum_retry_count: None,
    });

    let host_config = HostConfig {
        network_mode: spec.network_mode.clone(),
        privileged: Some(spec.privileged),
        restart_policy,
        ..Default::default()
    };

    ContainerConfig {
        image: Some(spec.image.clone()),
        cmd: non_empty(&spec.command),
        entrypoint: non_empty(&spec.entrypoint),
        env: non_empty(&spec.environment),
        labels: Some(spec.labels.clone()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

/// Docker registry auth config as stored in the `registry-auth` policy file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegistryAuthConfig {
    username: Option<String>,
    password: Option<String>,
    auth: Option<String>,
    email: Option<String>,
    serveraddress: Option<String>,
    identitytoken: Option<String>,
    registrytoken: Option<String>,
}

/// Decode the raw registry auth blob into Docker credentials.
///
/// Accepts the `X-Registry-Auth` form (base64, standard or URL-safe, of a
/// JSON auth config) as well as the bare JSON. An empty blob means anonymous.
///
/// # Errors
///
/// Returns [`EngineError::InvalidRegistryAuth`] when neither form parses.
pub fn decode_registry_auth(raw: &str) -> Result<Option<DockerCredentials>, EngineError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let json = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(raw))
        .unwrap_or_else(|_| raw.as_bytes().to_vec());

    let config: RegistryAuthConfig = serde_json::from_slice(&json)
        .map_err(|e| EngineError::InvalidRegistryAuth(e.to_string()))?;

    Ok(Some(DockerCredentials {
        username: config.username,
        password: config.password,
        auth: config.auth,
        email: config.email,
        serveraddress: config.serveraddress,
        identitytoken: config.identitytoken,
        registrytoken: config.registrytoken,
    }))
}
