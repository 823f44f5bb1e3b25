// ABOUTME: Docker runtime adapter built on bollard
// ABOUTME: Labels every container it creates and only lists labelled containers

use crate::container::{
    ContainerState, LogChunk, LogOptions, ObservedContainer, OutputStream, StreamType,
    LOG_CHANNEL_CAPACITY,
};
use crate::error::{Result, RuntimeError};
use crate::{ContainerRuntime, LABEL_FINGERPRINT, LABEL_MANAGED, LABEL_NAME};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    errors::Error as BollardError,
    image::CreateImageOptions,
    models::{
        ContainerSummary, HostConfig, PortBinding, PortMap, PortTypeEnum, RestartPolicyNameEnum,
    },
    Docker,
};
use chrono::{DateTime, Utc};
use dockformer_manifest::{ContainerSpec, PortMapping, Protocol, RestartPolicy};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Grace period handed to the engine before it kills a stopping container
    pub stop_grace: Duration,
    /// Upper bound for pulling a missing image during create
    pub pull_timeout: Duration,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            pull_timeout: Duration::from_secs(600),
        }
    }
}

pub struct DockerRuntime {
    client: Docker,
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    /// Connect using the local defaults (DOCKER_HOST or the platform socket)
    pub fn connect(config: DockerRuntimeConfig) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Docker, config: DockerRuntimeConfig) -> Self {
        Self { client, config }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_error(image, e)),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            return Ok(());
        }
        self.pull_image(image).await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(
            "Pulling image: {} (timeout: {:?})",
            image, self.config.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.config.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                match result {
                    Ok(progress) => {
                        if let Some(status) = &progress.status {
                            if status != &last_status {
                                debug!("Pull status: {}", status);
                                last_status = status.clone();
                            }
                        }
                        if let Some(error) = progress.error {
                            return Err(RuntimeError::Operation(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                    }
                    Err(e) => return Err(map_error(image, e)),
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::Timeout(self.config.pull_timeout)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn list(&self) -> Result<Vec<ObservedContainer>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", LABEL_MANAGED)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError { message, .. } => {
                    RuntimeError::Operation(message)
                }
                other => RuntimeError::Unavailable(other.to_string()),
            })?;

        Ok(summaries.into_iter().filter_map(from_summary).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ObservedContainer> {
        let inspect = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| map_error(id, e))?;

        let status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| s.as_ref())
            .unwrap_or("unknown");

        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();

        let name = labels.get(LABEL_NAME).cloned().unwrap_or_else(|| {
            inspect
                .name
                .as_deref()
                .unwrap_or(id)
                .trim_start_matches('/')
                .to_string()
        });

        let image = inspect
            .config
            .as_ref()
            .and_then(|c| c.image.clone())
            .unwrap_or_default();

        let created_at = inspect
            .created
            .as_ref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let ports = inspect
            .host_config
            .as_ref()
            .and_then(|h| h.port_bindings.as_ref())
            .map(mappings_from_port_map)
            .unwrap_or_default();

        Ok(ObservedContainer::new(
            inspect.id.unwrap_or_else(|| id.to_string()),
            name,
            image,
            convert_status(status),
            created_at,
        )
        .with_ports(ports)
        .with_fingerprint(labels.get(LABEL_FINGERPRINT).cloned()))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ObservedContainer> {
        info!("Creating container: {} ({})", spec.name, spec.image);

        self.ensure_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .client
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError { message, .. } => {
                    RuntimeError::Operation(message)
                }
                other => RuntimeError::Unavailable(other.to_string()),
            })?;

        for warning in &created.warnings {
            warn!("Docker warning for {}: {}", spec.name, warning);
        }
        debug!("Created container {} as {}", spec.name, created.id);

        self.inspect(&created.id).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        info!("Starting container: {}", id);
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            // 304: already running
            Ok(()) | Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => {
                Ok(())
            }
            Err(e) => Err(map_error(id, e)),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        info!(
            "Stopping container: {} (grace: {:?})",
            id, self.config.stop_grace
        );
        let options = StopContainerOptions {
            t: self.config.stop_grace.as_secs() as i64,
        };
        match self.client.stop_container(id, Some(options)).await {
            // 304: already stopped
            Ok(()) | Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => {
                Ok(())
            }
            Err(e) => Err(map_error(id, e)),
        }
    }

    async fn restart(&self, id: &str) -> Result<()> {
        info!("Restarting container: {}", id);
        let options = RestartContainerOptions {
            t: self.config.stop_grace.as_secs() as isize,
        };
        self.client
            .restart_container(id, Some(options))
            .await
            .map_err(|e| map_error(id, e))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        info!("Removing container: {}", id);
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.client
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_error(id, e))
    }

    async fn logs(&self, id: &str, options: LogOptions) -> Result<OutputStream> {
        // Surface NotFound before the pump starts
        self.client
            .inspect_container(id, None)
            .await
            .map_err(|e| map_error(id, e))?;

        let log_options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: options.follow,
            tail: options
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let logs = self.client.logs(id, Some(log_options));
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let container = id.to_string();

        tokio::spawn(async move {
            let mut stream = Box::pin(logs);
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(output)) => {
                        let (stream_type, data) = match output {
                            LogOutput::StdOut { message } => (StreamType::Stdout, message.to_vec()),
                            LogOutput::StdErr { message } => (StreamType::Stderr, message.to_vec()),
                            LogOutput::Console { message } => {
                                (StreamType::Stdout, message.to_vec())
                            }
                            _ => continue,
                        };

                        let chunk = LogChunk {
                            timestamp: Utc::now(),
                            stream: stream_type,
                            data,
                        };

                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(map_error(&container, e))).await;
                        break;
                    }
                    None => break,
                }
            }
            debug!("Log pump for {} finished", container);
        });

        Ok(OutputStream::new(rx))
    }
}

/// Translate a spec into the engine's create request
fn container_config(spec: &ContainerSpec) -> Config<String> {
    let labels = HashMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_NAME.to_string(), spec.name.clone()),
        (LABEL_FINGERPRINT.to_string(), spec.fingerprint()),
    ]);

    let mut exposed_ports = HashMap::new();
    let mut port_bindings: PortMap = HashMap::new();

    for port in &spec.ports {
        let key = format!("{}/{}", port.container_port, port.protocol);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings
            .entry(key)
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.host_port.to_string()),
            });
    }

    let binds: Vec<String> = spec.volumes.iter().map(|v| v.to_bind()).collect();
    let env: Vec<String> = spec
        .env
        .iter()
        .map(|e| format!("{}={}", e.name, e.value))
        .collect();

    let host_config = HostConfig {
        binds: if binds.is_empty() { None } else { Some(binds) },
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        restart_policy: Some(restart_policy(&spec.restart_policy)),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: spec.command.clone(),
        env: Some(env),
        labels: Some(labels),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn restart_policy(policy: &RestartPolicy) -> bollard::models::RestartPolicy {
    let (name, maximum_retry_count) = match policy {
        RestartPolicy::No => (RestartPolicyNameEnum::NO, None),
        RestartPolicy::Always => (RestartPolicyNameEnum::ALWAYS, None),
        RestartPolicy::UnlessStopped => (RestartPolicyNameEnum::UNLESS_STOPPED, None),
        RestartPolicy::OnFailure { max_retries } => (
            RestartPolicyNameEnum::ON_FAILURE,
            max_retries.map(i64::from),
        ),
    };
    bollard::models::RestartPolicy {
        name: Some(name),
        maximum_retry_count,
    }
}

fn from_summary(summary: ContainerSummary) -> Option<ObservedContainer> {
    let id = summary.id?;
    let labels = summary.labels.unwrap_or_default();

    let name = labels.get(LABEL_NAME).cloned().or_else(|| {
        summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|n| n.trim_start_matches('/').to_string())
    })?;

    let created_at = summary
        .created
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    let mut ports: Vec<PortMapping> = summary
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|port| {
            Some(PortMapping {
                host_port: port.public_port?,
                container_port: port.private_port,
                protocol: match port.typ {
                    Some(PortTypeEnum::UDP) => Protocol::Udp,
                    _ => Protocol::Tcp,
                },
            })
        })
        .collect();
    // Engines report one entry per bound address family
    ports.sort();
    ports.dedup();

    Some(
        ObservedContainer::new(
            id,
            name,
            summary.image.unwrap_or_default(),
            convert_status(summary.state.as_deref().unwrap_or("unknown")),
            created_at,
        )
        .with_ports(ports)
        .with_fingerprint(labels.get(LABEL_FINGERPRINT).cloned()),
    )
}

fn mappings_from_port_map(port_map: &PortMap) -> Vec<PortMapping> {
    let mut ports = Vec::new();
    for (key, bindings) in port_map {
        let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        let Ok(container_port) = port.parse::<u16>() else {
            continue;
        };
        let protocol = if proto == "udp" {
            Protocol::Udp
        } else {
            Protocol::Tcp
        };
        for binding in bindings.iter().flatten() {
            if let Some(Ok(host_port)) = binding.host_port.as_deref().map(str::parse::<u16>) {
                ports.push(PortMapping {
                    host_port,
                    container_port,
                    protocol,
                });
            }
        }
    }
    ports.sort();
    ports.dedup();
    ports
}

fn convert_status(state: &str) -> ContainerState {
    match state.to_lowercase().as_str() {
        "created" => ContainerState::Created,
        "running" | "restarting" => ContainerState::Running,
        "paused" => ContainerState::Paused,
        "exited" => ContainerState::Stopped,
        "removing" => ContainerState::Removing,
        _ => ContainerState::Error,
    }
}

fn map_error(target: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{}: {}", target, message)),
        BollardError::DockerResponseServerError { message, .. } => {
            RuntimeError::Operation(format!("{}: {}", target, message))
        }
        other => RuntimeError::Unavailable(other.to_string()),
    }
}
