//! In-memory container engine for tests.
//!
//! Interactive sessions behave like a TTY with echo: every input byte is
//! written straight back as output until the input side is closed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use super::{
    ContainerConfig, ContainerRuntimeApi, ContainerStats, ExecChannel, ManagedContainer,
    SandboxError, SandboxResult,
};

#[derive(Debug, Clone)]
struct FakeContainer {
    name: String,
    running: bool,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    created: Vec<ContainerConfig>,
    failing_stops: HashSet<String>,
    stop_calls: Vec<String>,
    exec_output: Vec<u8>,
    last_exec: Option<Vec<String>>,
    unavailable_listing: bool,
    next_id: u64,
}

/// Engine double backed by a map of containers.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    channels_opened: Arc<AtomicUsize>,
    channels_closed: Arc<AtomicUsize>,
}

impl FakeRuntime {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a running container as if something else had started it.
    pub fn insert_container(&self, id: &str, name: &str, created_at: Option<DateTime<Utc>>) {
        self.state().containers.insert(
            id.to_string(),
            FakeContainer {
                name: name.to_string(),
                running: true,
                created_at,
            },
        );
    }

    /// Remove a container behind the orchestrator's back.
    pub fn remove_out_of_band(&self, id: &str) {
        self.state().containers.remove(id);
    }

    /// Let a container's main process exit without removing it.
    pub fn mark_exited(&self, id: &str) {
        if let Some(container) = self.state().containers.get_mut(id) {
            container.running = false;
        }
    }

    pub fn fail_stop_for(&self, id: &str) {
        self.state().failing_stops.insert(id.to_string());
    }

    pub fn clear_stop_failures(&self) {
        self.state().failing_stops.clear();
    }

    /// Make `list_containers` fail until cleared.
    pub fn set_listing_unavailable(&self, unavailable: bool) {
        self.state().unavailable_listing = unavailable;
    }

    pub fn set_exec_output(&self, output: Vec<u8>) {
        self.state().exec_output = output;
    }

    pub fn last_exec(&self) -> Option<Vec<String>> {
        self.state().last_exec.clone()
    }

    pub fn created_configs(&self) -> Vec<ContainerConfig> {
        self.state().created.clone()
    }

    pub fn stop_calls(&self) -> Vec<String> {
        self.state().stop_calls.clone()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state().containers.contains_key(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state()
            .containers
            .get(id)
            .is_some_and(|c| c.running)
    }

    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst)
    }

    /// Interactive sessions whose input side has been shut down.
    pub fn channels_closed(&self) -> usize {
        self.channels_closed.load(Ordering::SeqCst)
    }

    fn require_running(&self, id: &str) -> SandboxResult<()> {
        match self.state().containers.get(id) {
            Some(c) if c.running => Ok(()),
            Some(_) => Err(SandboxError::engine("exec", "container is not running")),
            None => Err(SandboxError::HandleNotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_and_start(&self, config: &ContainerConfig) -> SandboxResult<String> {
        config.validate()?;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("fake{:060}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: config.name.clone().unwrap_or_else(|| id.clone()),
                running: true,
                created_at: None,
            },
        );
        state.created.push(config.clone());
        Ok(id)
    }

    async fn stop_container(&self, container_id: &str) -> SandboxResult<()> {
        let mut state = self.state();
        state.stop_calls.push(container_id.to_string());
        if state.failing_stops.contains(container_id) {
            return Err(SandboxError::engine("stop", "engine timeout"));
        }
        match state.containers.get_mut(container_id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(SandboxError::HandleNotFound(container_id.to_string())),
        }
    }

    async fn remove_container(&self, container_id: &str) -> SandboxResult<()> {
        match self.state().containers.remove(container_id) {
            Some(_) => Ok(()),
            None => Err(SandboxError::HandleNotFound(container_id.to_string())),
        }
    }

    async fn exec_output(&self, container_id: &str, command: &[String]) -> SandboxResult<Vec<u8>> {
        self.require_running(container_id)?;
        let mut state = self.state();
        state.last_exec = Some(command.to_vec());
        Ok(state.exec_output.clone())
    }

    async fn exec_interactive(
        &self,
        container_id: &str,
        _command: &[String],
    ) -> SandboxResult<ExecChannel> {
        self.require_running(container_id)?;

        let (ours_in, mut shell_in) = tokio::io::duplex(4096);
        let (mut shell_out, ours_out) = tokio::io::duplex(4096);
        let closed = self.channels_closed.clone();
        self.channels_opened.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match shell_in.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if shell_out.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            closed.fetch_add(1, Ordering::SeqCst);
        });

        let output = ReaderStream::new(ours_out).map(|chunk| chunk.map_err(SandboxError::from));
        Ok(ExecChannel::new(output, ours_in))
    }

    async fn get_stats(&self, container_id: &str) -> SandboxResult<ContainerStats> {
        self.require_running(container_id)?;
        Ok(ContainerStats {
            container_id: container_id.to_string(),
            cpu_percent: 1.5,
            memory_usage_bytes: 64 * 1024 * 1024,
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            memory_percent: 3.125,
            pids: 2,
        })
    }

    async fn list_containers(&self, name_prefix: &str) -> SandboxResult<Vec<ManagedContainer>> {
        let state = self.state();
        if state.unavailable_listing {
            return Err(SandboxError::engine("list", "connection refused"));
        }
        // Substring match, like the engine's name filter.
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.name.contains(name_prefix))
            .map(|(id, c)| ManagedContainer {
                id: id.clone(),
                name: c.name.clone(),
                state: if c.running { "running" } else { "exited" }.to_string(),
                created_at: c.created_at,
            })
            .collect())
    }

    async fn health_check(&self) -> SandboxResult<()> {
        Ok(())
    }
}
