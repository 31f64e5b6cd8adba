use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, warn};

use domain::runtime::{
    ContainerRuntime, ContainerSpec, LogChunk, LogStream, ManagedContainer, ManagedNetwork,
    RuntimeError, StreamKind, network_runtime_name,
};
use domain::state::ServiceConfig;

use super::extract;
use super::labels;

/// Adapter from the `ContainerRuntime` port to the Docker Engine API.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    stop_grace_secs: i64,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))?;
        Ok(Self {
            docker,
            stop_grace_secs: 10,
        })
    }

    pub fn with_docker(docker: Docker) -> Self {
        Self {
            docker,
            stop_grace_secs: 10,
        }
    }

    fn managed_filter() -> HashMap<String, Vec<String>> {
        HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", labels::MANAGED)],
        )])
    }

    fn container_name(spec: &ContainerSpec) -> String {
        format!(
            "{}_{}_{}",
            spec.service_name, spec.service_id, spec.app_id
        )
    }

    fn managed_labels(spec: &ContainerSpec) -> HashMap<String, String> {
        let mut out: HashMap<String, String> = spec
            .config
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.insert(labels::MANAGED.to_string(), "true".to_string());
        out.insert(labels::APP_ID.to_string(), spec.app_id.to_string());
        out.insert(labels::APP_NAME.to_string(), spec.app_name.clone());
        out.insert(labels::SERVICE_ID.to_string(), spec.service_id.to_string());
        out.insert(
            labels::SERVICE_NAME.to_string(),
            spec.service_name.clone(),
        );
        out
    }

    async fn extract_container(
        &self,
        container_id: &str,
        identity: extract::ManagedIdentity,
        status: String,
    ) -> Result<ManagedContainer, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| map_err(e, "inspect container"))?;

        let container_config = inspect.config.unwrap_or_default();
        let network_settings = inspect.network_settings.unwrap_or_default();

        let environment = extract::env_from_list(container_config.env.as_ref());
        let ports = extract::ports_from_map(network_settings.ports.as_ref());
        let attachments: Vec<String> = network_settings
            .networks
            .as_ref()
            .map(|nets| nets.keys().cloned().collect())
            .unwrap_or_default();
        let networks =
            extract::networks_from_attachments(attachments.iter(), identity.app_id);

        let host_config = inspect.host_config.unwrap_or_default();
        let volumes = host_config.binds.clone().unwrap_or_default();
        let restart = host_config
            .restart_policy
            .as_ref()
            .and_then(|policy| policy.name.as_ref())
            .and_then(restart_policy_string);

        let image = container_config.image.clone().unwrap_or_default();
        let config = ServiceConfig {
            image: image.clone(),
            ports,
            environment,
            volumes,
            networks,
            restart,
            command: container_config.cmd.clone().unwrap_or_default(),
            labels: container_config
                .labels
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect(),
        };

        let created_at = inspect
            .created
            .as_deref()
            .and_then(parse_runtime_time);
        let started_at = inspect
            .state
            .as_ref()
            .and_then(|state| state.started_at.as_deref())
            .and_then(parse_runtime_time);

        Ok(ManagedContainer {
            container_id: container_id.to_string(),
            app_id: identity.app_id,
            app_name: identity.app_name,
            service_id: identity.service_id,
            service_name: identity.service_name,
            status,
            created_at,
            started_at,
            config,
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))
    }

    async fn list_containers(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: Self::managed_filter(),
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_err(e, "list containers"))?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(container_id) = summary.id else {
                continue;
            };
            let Some(identity) =
                summary.labels.as_ref().and_then(extract::managed_identity)
            else {
                debug!(container_id = %container_id, "Skipping container with incomplete labels");
                continue;
            };
            let status = extract::normalize_status(summary.state.as_deref());
            // Per-container best effort: a container removed between the
            // list and its inspect just drops out of this observation.
            match self.extract_container(&container_id, identity, status).await {
                Ok(container) => containers.push(container),
                Err(e) => {
                    debug!(container_id = %container_id, "Skipping container, inspect failed: {}", e);
                }
            }
        }
        Ok(containers)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &spec.config.ports {
            let Some(parsed) = extract::parse_port_spec(port) else {
                warn!(port = %port, service = %spec.service_name, "Ignoring malformed port mapping");
                continue;
            };
            let key = format!("{}/{}", parsed.container_port, parsed.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: None,
                    host_port: Some(parsed.host_port),
                });
        }

        let env: Vec<String> = spec
            .config
            .environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let networks: Vec<String> = spec
            .config
            .networks
            .iter()
            .map(|name| network_runtime_name(spec.app_id, name))
            .collect();

        let host_config = HostConfig {
            binds: (!spec.config.volumes.is_empty()).then(|| spec.config.volumes.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            restart_policy: spec
                .config
                .restart
                .as_deref()
                .map(|name| RestartPolicy {
                    name: Some(parse_restart_policy(name)),
                    maximum_retry_count: None,
                }),
            network_mode: networks.first().cloned(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.config.image.clone()),
            env: (!env.is_empty()).then_some(env),
            cmd: (!spec.config.command.is_empty()).then(|| spec.config.command.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            labels: Some(Self::managed_labels(spec)),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Self::container_name(spec),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| map_err(e, "create container"))?;

        // The first network rides along as network_mode; join the rest.
        for network in networks.iter().skip(1) {
            self.docker
                .connect_network(
                    network,
                    ConnectNetworkOptions {
                        container: created.id.clone(),
                        endpoint_config: Default::default(),
                    },
                )
                .await
                .map_err(|e| map_err(e, "connect network"))?;
        }

        Ok(created.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already started
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err(e, "start container")),
        }
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_secs: i64,
    ) -> Result<(), RuntimeError> {
        let timeout = if timeout_secs > 0 {
            timeout_secs
        } else {
            self.stop_grace_secs
        };
        match self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: timeout }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err(e, "stop container")),
        }
    }

    async fn remove_container(
        &self,
        container_id: &str,
        force: bool,
    ) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_err(e, "remove container"))
    }

    async fn restart_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .restart_container(
                container_id,
                Some(RestartContainerOptions {
                    t: self.stop_grace_secs as isize,
                }),
            )
            .await
            .map_err(|e| map_err(e, "restart container"))
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %reference, status = %status, "Pull progress");
                    }
                }
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    message,
                }) => return Err(RuntimeError::ImageNotFound(message)),
                Err(e) => return Err(map_err(e, "pull image")),
            }
        }
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<ManagedNetwork>, RuntimeError> {
        let options = ListNetworksOptions {
            filters: Self::managed_filter(),
        };
        let networks = self
            .docker
            .list_networks(Some(options))
            .await
            .map_err(|e| map_err(e, "list networks"))?;

        Ok(networks
            .into_iter()
            .filter_map(|network| {
                let network_labels = network.labels?;
                let app_id: i64 = network_labels.get(labels::APP_ID)?.parse().ok()?;
                let name = network_labels.get(labels::NETWORK_NAME)?.clone();
                Some(ManagedNetwork {
                    id: network.id.unwrap_or_default(),
                    app_id,
                    name,
                })
            })
            .collect())
    }

    async fn create_network(&self, app_id: i64, name: &str) -> Result<String, RuntimeError> {
        let runtime_name = network_runtime_name(app_id, name);
        let options = CreateNetworkOptions {
            name: runtime_name.clone(),
            labels: HashMap::from([
                (labels::MANAGED.to_string(), "true".to_string()),
                (labels::APP_ID.to_string(), app_id.to_string()),
                (labels::NETWORK_NAME.to_string(), name.to_string()),
            ]),
            ..Default::default()
        };
        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(|e| map_err(e, "create network"))?;
        Ok(response.id.unwrap_or(runtime_name))
    }

    async fn remove_network(&self, app_id: i64, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_network(&network_runtime_name(app_id, name))
            .await
            .map_err(|e| map_err(e, "remove network"))
    }

    fn attach_log_stream(&self, container_id: &str) -> LogStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            since: Utc::now().timestamp(),
            tail: "0".to_string(),
            ..Default::default()
        };
        self.docker
            .logs(container_id, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdOut { message }) => Some(Ok(LogChunk::Typed {
                        kind: StreamKind::Stdout,
                        payload: message,
                    })),
                    Ok(LogOutput::StdErr { message }) => Some(Ok(LogChunk::Typed {
                        kind: StreamKind::Stderr,
                        payload: message,
                    })),
                    // Raw console output may still be multiplexed; the
                    // monitor runs it through the frame decoder.
                    Ok(LogOutput::Console { message }) => Some(Ok(LogChunk::Raw(message))),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(RuntimeError::Transient(e.to_string()))),
                }
            })
            .boxed()
    }
}

fn map_err(error: bollard::errors::Error, context: &str) -> RuntimeError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => RuntimeError::ContainerNotFound(message),
            409 => RuntimeError::Other(format!("{context}: conflict: {message}")),
            429 | 500..=599 => RuntimeError::Transient(format!("{context}: {message}")),
            _ => RuntimeError::Other(format!("{context}: {status_code} {message}")),
        },
        other => RuntimeError::Unreachable(format!("{context}: {other}")),
    }
}

fn parse_restart_policy(name: &str) -> RestartPolicyNameEnum {
    match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::NO,
    }
}

fn restart_policy_string(name: &RestartPolicyNameEnum) -> Option<String> {
    match name {
        RestartPolicyNameEnum::ALWAYS => Some("always".to_string()),
        RestartPolicyNameEnum::UNLESS_STOPPED => Some("unless-stopped".to_string()),
        RestartPolicyNameEnum::ON_FAILURE => Some("on-failure".to_string()),
        RestartPolicyNameEnum::NO => Some("no".to_string()),
        RestartPolicyNameEnum::EMPTY => None,
    }
}

/// Docker reports `0001-01-01T00:00:00Z` for never-started containers.
fn parse_runtime_time(value: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value).ok()?.with_timezone(&Utc);
    use chrono::Datelike;
    (parsed.year() > 1).then_some(parsed)
}
