//! Container engine access.
//!
//! [`ContainerRuntimeApi`] is the seam between the orchestrator and the
//! engine. [`DockerRuntime`] talks to the Docker Engine API over the local
//! socket.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::HostConfig;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{ContainerConfig, ExecChannel, SandboxError, SandboxResult};

/// Seconds the engine waits for a graceful stop before killing.
const STOP_TIMEOUT_SECONDS: i64 = 10;

const CPU_PERIOD: i64 = 100_000;

/// A container observed through the engine listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedContainer {
    /// Engine handle.
    pub id: String,
    /// Name without the leading `/`.
    pub name: String,
    /// Engine lifecycle state (`running`, `exited`, ...).
    pub state: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl ManagedContainer {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub container_id: String,
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub pids: u64,
}

#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a container, returning its handle.
    async fn create_and_start(&self, config: &ContainerConfig) -> SandboxResult<String>;

    /// Stop a container. An already stopped container is not an error.
    async fn stop_container(&self, container_id: &str) -> SandboxResult<()>;

    async fn remove_container(&self, container_id: &str) -> SandboxResult<()>;

    /// Run a command to completion and return combined stdout/stderr bytes.
    async fn exec_output(&self, container_id: &str, command: &[String]) -> SandboxResult<Vec<u8>>;

    /// Open a TTY exec session attached to stdin/stdout/stderr.
    async fn exec_interactive(
        &self,
        container_id: &str,
        command: &[String],
    ) -> SandboxResult<ExecChannel>;

    /// One stats sample (not a stream).
    async fn get_stats(&self, container_id: &str) -> SandboxResult<ContainerStats>;

    /// All containers, in any state, whose name starts with `name_prefix`.
    async fn list_containers(&self, name_prefix: &str) -> SandboxResult<Vec<ManagedContainer>>;

    async fn health_check(&self) -> SandboxResult<()>;
}

/// Docker Engine API client.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub fn connect_local() -> SandboxResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::engine("connect", e))?;
        Ok(Self { docker })
    }

    /// Connect to an explicit unix socket.
    pub fn connect_socket(path: &Path, timeout_seconds: u64) -> SandboxResult<Self> {
        let docker = Docker::connect_with_socket(
            &path.display().to_string(),
            timeout_seconds,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(|e| SandboxError::engine("connect", e))?;
        Ok(Self { docker })
    }
}

/// Map engine errors, turning 404 into [`SandboxError::HandleNotFound`].
fn map_engine_error(operation: &str, container_id: &str, err: DockerError) -> SandboxError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => SandboxError::HandleNotFound(container_id.to_string()),
        other => SandboxError::engine(operation, other),
    }
}

fn log_output_bytes(chunk: LogOutput) -> bytes::Bytes {
    chunk.into_bytes()
}

#[async_trait]
impl ContainerRuntimeApi for DockerRuntime {
    async fn create_and_start(&self, config: &ContainerConfig) -> SandboxResult<String> {
        config.validate()?;

        let host_config = HostConfig {
            binds: Some(config.binds()),
            memory: config.memory_limit,
            // Equal to memory: no swap on top of the ceiling.
            memory_swap: config.memory_limit,
            cpu_period: config.cpu_quota.map(|_| CPU_PERIOD),
            cpu_quota: config
                .cpu_quota
                .map(|cores| (cores * CPU_PERIOD as f64) as i64),
            ..Default::default()
        };

        let body = Config {
            image: Some(config.image.clone()),
            cmd: (!config.command.is_empty()).then(|| config.command.clone()),
            env: Some(config.env_list()),
            working_dir: config.workdir.clone(),
            user: config.user.clone(),
            labels: (!config.labels.is_empty()).then(|| config.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = config.name.clone().map(|name| CreateContainerOptions {
            name,
            platform: None,
        });

        let created = self
            .docker
            .create_container(options, body)
            .await
            .map_err(|e| SandboxError::engine("create", e))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Do not leak a created-but-never-started container.
            if let Err(remove_err) = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!(
                    "failed to remove unstarted container {}: {}",
                    created.id, remove_err
                );
            }
            return Err(SandboxError::engine("start", e));
        }

        info!(
            "started container {} ({})",
            config.name.as_deref().unwrap_or("unnamed"),
            created.id
        );
        Ok(created.id)
    }

    async fn stop_container(&self, container_id: &str) -> SandboxResult<()> {
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECONDS,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_engine_error("stop", container_id, e)),
        }
    }

    async fn remove_container(&self, container_id: &str) -> SandboxResult<()> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_engine_error("remove", container_id, e))
    }

    async fn exec_output(&self, container_id: &str, command: &[String]) -> SandboxResult<Vec<u8>> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_engine_error("exec", container_id, e))?;

        let mut collected = Vec::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| map_engine_error("exec", container_id, e))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    let chunk = chunk.map_err(|e| SandboxError::engine("exec", e))?;
                    collected.extend_from_slice(&log_output_bytes(chunk));
                }
            }
            StartExecResults::Detached => {
                debug!("exec in {} detached unexpectedly", container_id);
            }
        }

        Ok(collected)
    }

    async fn exec_interactive(
        &self,
        container_id: &str,
        command: &[String],
    ) -> SandboxResult<ExecChannel> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_engine_error("exec", container_id, e))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_engine_error("exec", container_id, e))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output = output.map(|chunk| {
                    chunk
                        .map(log_output_bytes)
                        .map_err(|e| SandboxError::engine("exec", e))
                });
                Ok(ExecChannel::new(output, input))
            }
            StartExecResults::Detached => Err(SandboxError::engine(
                "exec",
                "engine returned a detached session for an interactive exec",
            )),
        }
    }

    async fn get_stats(&self, container_id: &str) -> SandboxResult<ContainerStats> {
        let mut stream = Box::pin(self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        ));

        match stream.next().await {
            Some(Ok(stats)) => Ok(summarize_stats(container_id, &stats)),
            Some(Err(e)) => Err(map_engine_error("stats", container_id, e)),
            None => Err(SandboxError::engine("stats", "engine returned no sample")),
        }
    }

    async fn list_containers(&self, name_prefix: &str) -> SandboxResult<Vec<ManagedContainer>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name_prefix.to_string()]);

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::engine("list", e))?;

        // The engine's name filter is a substring match; enforce the prefix here.
        let containers = summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .find(|n| n.starts_with(name_prefix))?;
                Some(ManagedContainer {
                    id,
                    name,
                    state: summary.state.unwrap_or_default(),
                    created_at: summary
                        .created
                        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
                })
            })
            .collect();

        Ok(containers)
    }

    async fn health_check(&self) -> SandboxResult<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| SandboxError::engine("ping", e))?;
        Ok(())
    }
}

/// Reduce a raw engine sample to the fields the API exposes.
///
/// CPU percentage uses the same delta formula as `docker stats`.
fn summarize_stats(container_id: &str, stats: &Stats) -> ContainerStats {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage) as f64;
    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or_default()
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or_default())
        as f64;
    let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;

    let cpu_percent = if system_delta > 0.0 {
        cpu_delta / system_delta * online_cpus * 100.0
    } else {
        0.0
    };

    let usage = stats.memory_stats.usage.unwrap_or_default();
    let limit = stats.memory_stats.limit.unwrap_or_default();
    let memory_percent = if limit > 0 {
        usage as f64 / limit as f64 * 100.0
    } else {
        0.0
    };

    ContainerStats {
        container_id: container_id.to_string(),
        cpu_percent,
        memory_usage_bytes: usage,
        memory_limit_bytes: limit,
        memory_percent,
        pids: stats.pids_stats.current.unwrap_or_default(),
    }
}
