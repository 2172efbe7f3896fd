//! Sandbox lifecycle on top of the container engine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use rand::Rng;

use super::{
    ContainerConfig, ContainerRuntimeApi, ContainerStats, ExecChannel, ManagedContainer,
    SandboxError, SandboxResult, WorkspaceResolver,
};

/// Longest slug kept in a container name.
const MAX_SLUG_LEN: usize = 48;

/// Fixed limits and identity applied to every sandbox.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Management namespace; every container name starts with `<prefix>_`.
    pub name_prefix: String,
    /// Mount point of the workspace inside the container.
    pub workspace_mount: String,
    pub memory_limit_bytes: i64,
    pub cpu_quota: f64,
    pub run_as_user: String,
    /// Shell for interactive sessions.
    pub shell: Vec<String>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            name_prefix: "openv".to_string(),
            workspace_mount: "/workspace".to_string(),
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            cpu_quota: 1.0,
            run_as_user: "1000:1000".to_string(),
            shell: vec!["/bin/sh".to_string()],
        }
    }
}

/// Starts, stops and inspects sandboxes.
///
/// The engine client is optional: when it could not be constructed at
/// startup every operation fails fast with [`SandboxError::EngineUnavailable`].
#[derive(Clone)]
pub struct SandboxOrchestrator {
    runtime: Option<Arc<dyn ContainerRuntimeApi>>,
    resolver: WorkspaceResolver,
    limits: SandboxLimits,
}

impl SandboxOrchestrator {
    pub fn new(
        runtime: Option<Arc<dyn ContainerRuntimeApi>>,
        resolver: WorkspaceResolver,
        limits: SandboxLimits,
    ) -> Self {
        Self {
            runtime,
            resolver,
            limits,
        }
    }

    fn runtime(&self) -> SandboxResult<&Arc<dyn ContainerRuntimeApi>> {
        self.runtime.as_ref().ok_or(SandboxError::EngineUnavailable)
    }

    pub fn is_available(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn resolver(&self) -> &WorkspaceResolver {
        &self.resolver
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Launch a sandbox for a session and return its engine handle.
    ///
    /// The handle is not persisted here.
    pub async fn start_session(
        &self,
        name: &str,
        tenant_id: i64,
        session_id: i64,
        image: &str,
        command: &[String],
        env: &HashMap<String, String>,
    ) -> SandboxResult<String> {
        let runtime = self.runtime()?;
        let workspace = self.resolver.ensure(tenant_id, session_id)?;
        hand_over_workspace(&workspace, &self.limits.run_as_user);
        let container_name = self.container_name(name);

        let config = ContainerConfig::new(image)
            .name(&container_name)
            .command(command.to_vec())
            .env("PROJECT_NAME", name)
            .envs(env)
            .volume(
                workspace.display().to_string(),
                self.limits.workspace_mount.clone(),
            )
            .workdir(self.limits.workspace_mount.clone())
            .user(self.limits.run_as_user.clone())
            .memory_limit(self.limits.memory_limit_bytes)
            .cpu_quota(self.limits.cpu_quota)
            .label("openv.tenant", tenant_id.to_string())
            .label("openv.session", session_id.to_string());
        config.validate()?;

        info!(
            "starting sandbox {} for tenant {} session {} (workspace {})",
            container_name,
            tenant_id,
            session_id,
            workspace.display()
        );
        runtime.create_and_start(&config).await
    }

    /// Stop and remove a sandbox. A handle the engine no longer knows is
    /// treated as already stopped.
    pub async fn stop_session(&self, handle: &str) -> SandboxResult<()> {
        let runtime = self.runtime()?;

        match runtime.stop_container(handle).await {
            Ok(()) => {}
            Err(SandboxError::HandleNotFound(_)) => {
                debug!("container {} already gone before stop", handle);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match runtime.remove_container(handle).await {
            Ok(()) | Err(SandboxError::HandleNotFound(_)) => {
                info!("stopped sandbox {}", handle);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run a shell command to completion; output is decoded leniently.
    pub async fn exec_command(&self, handle: &str, command: &str) -> SandboxResult<String> {
        let runtime = self.runtime()?;
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()];
        let output = runtime.exec_output(handle, &argv).await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    /// Open an interactive TTY shell in the sandbox.
    pub async fn open_interactive_channel(&self, handle: &str) -> SandboxResult<ExecChannel> {
        let runtime = self.runtime()?;
        runtime.exec_interactive(handle, &self.limits.shell).await
    }

    pub async fn stats(&self, handle: &str) -> SandboxResult<ContainerStats> {
        self.runtime()?.get_stats(handle).await
    }

    /// Containers in the management namespace, in any state.
    pub async fn list_managed(&self) -> SandboxResult<Vec<ManagedContainer>> {
        let prefix = format!("{}_", self.limits.name_prefix);
        let containers = self.runtime()?.list_containers(&prefix).await?;
        Ok(containers
            .into_iter()
            .filter(|c| c.name.starts_with(&prefix))
            .collect())
    }

    pub async fn health_check(&self) -> SandboxResult<()> {
        self.runtime()?.health_check().await
    }

    /// `<prefix>_<slug>_<8 hex>`; the suffix keeps concurrent starts of the
    /// same project from colliding.
    fn container_name(&self, name: &str) -> String {
        let suffix: u32 = rand::rng().random();
        format!("{}_{}_{:08x}", self.limits.name_prefix, slugify(name), suffix)
    }
}

impl std::fmt::Debug for SandboxOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxOrchestrator")
            .field("available", &self.runtime.is_some())
            .field("root", &self.resolver.root())
            .field("limits", &self.limits)
            .finish()
    }
}

/// Numeric `uid` or `uid:gid`.
fn parse_uid_gid(user: &str) -> Option<(u32, Option<u32>)> {
    match user.split_once(':') {
        Some((uid, gid)) => Some((uid.parse().ok()?, Some(gid.parse().ok()?))),
        None => Some((user.parse().ok()?, None)),
    }
}

/// Give the sandbox user ownership of its workspace so the bind mount is
/// writable inside the container. Needs privileges the server may not have;
/// a failure is logged and the start continues.
#[cfg(unix)]
fn hand_over_workspace(workspace: &Path, run_as_user: &str) {
    use std::os::unix::fs::MetadataExt;

    let Some((uid, gid)) = parse_uid_gid(run_as_user) else {
        warn!("cannot hand over workspace: user {:?} is not numeric", run_as_user);
        return;
    };

    match std::fs::metadata(workspace) {
        Ok(meta) if meta.uid() == uid && gid.is_none_or(|g| meta.gid() == g) => return,
        Ok(_) => {}
        Err(e) => {
            warn!("cannot inspect workspace {}: {}", workspace.display(), e);
            return;
        }
    }

    if let Err(e) = std::os::unix::fs::chown(workspace, Some(uid), gid) {
        warn!(
            "failed to chown workspace {} to {}: {}",
            workspace.display(),
            run_as_user,
            e
        );
    }
}

#[cfg(not(unix))]
fn hand_over_workspace(_workspace: &Path, _run_as_user: &str) {}

/// Lowercase, spaces and other separators become `_`.
pub fn slugify(name: &str) -> String {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(MAX_SLUG_LEN)
        .collect();

    if slug.is_empty() {
        warn!("project name {:?} produced an empty slug", name);
        "project".to_string()
    } else {
        slug
    }
}
