//! Session service: request-scoped sandbox lifecycle.
//!
//! Composes the orchestrator and the record store. Store access is always a
//! short transaction and is never held across an engine call.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};

use crate::sandbox::{ContainerStats, ExecChannel, SandboxOrchestrator};
use crate::terminal::ActivityRecorder;

use super::models::SessionRecord;
use super::repository::SessionRepository;

/// Default sandbox image.
pub const DEFAULT_IMAGE: &str = "openv-env:latest";

/// Keeps a sandbox alive without doing any work.
pub const DEFAULT_COMMAND: &[&str] = &["tail", "-f", "/dev/null"];

/// Launch settings shared by every session.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    pub image: String,
    pub command: Vec<String>,
    /// Extra environment merged over `PROJECT_NAME`.
    pub extra_env: HashMap<String, String>,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            command: DEFAULT_COMMAND.iter().map(|s| s.to_string()).collect(),
            extra_env: HashMap::new(),
        }
    }
}

/// Service for managing project sandboxes on behalf of a tenant.
#[derive(Clone)]
pub struct SessionService {
    repo: SessionRepository,
    orchestrator: Arc<SandboxOrchestrator>,
    config: SessionServiceConfig,
}

impl SessionService {
    pub fn new(
        repo: SessionRepository,
        orchestrator: Arc<SandboxOrchestrator>,
        config: SessionServiceConfig,
    ) -> Self {
        Self {
            repo,
            orchestrator,
            config,
        }
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    pub fn orchestrator(&self) -> &Arc<SandboxOrchestrator> {
        &self.orchestrator
    }

    pub async fn create_session(&self, tenant_id: i64, name: &str) -> Result<SessionRecord> {
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("project name must be non-empty");
        }
        let record = self.repo.create(tenant_id, name).await?;
        info!(
            "created session {} ({}) for tenant {}",
            record.id, record.name, tenant_id
        );
        Ok(record)
    }

    pub async fn list_sessions(&self, tenant_id: i64) -> Result<Vec<SessionRecord>> {
        self.repo.list_for_tenant(tenant_id).await
    }

    /// Fetch a record owned by `tenant_id`. Records of other tenants are
    /// reported exactly like missing ones.
    pub async fn get_owned(&self, tenant_id: i64, id: i64) -> Result<SessionRecord> {
        match self.repo.get(id).await? {
            Some(record) if record.tenant_id == tenant_id => Ok(record),
            _ => anyhow::bail!("session {} not found", id),
        }
    }

    /// Start the session's sandbox. A record that already has a handle is
    /// returned unchanged.
    pub async fn start_session(&self, tenant_id: i64, id: i64) -> Result<SessionRecord> {
        let record = self.get_owned(tenant_id, id).await?;
        if record.is_running() {
            return Ok(record);
        }

        let handle = self
            .orchestrator
            .start_session(
                &record.name,
                tenant_id,
                id,
                &self.config.image,
                &self.config.command,
                &self.config.extra_env,
            )
            .await?;

        match self.repo.mark_running(id, &handle).await {
            Ok(record) => {
                info!("session {} running in {}", id, handle);
                Ok(record)
            }
            Err(e) => {
                // Unrecorded sandboxes would otherwise linger until the
                // reconciler finds them.
                if let Err(stop_err) = self.orchestrator.stop_session(&handle).await {
                    warn!(
                        "failed to stop unrecorded sandbox {} for session {}: {}",
                        handle, id, stop_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Stop the session's sandbox. A record without a handle is returned
    /// unchanged.
    pub async fn stop_session(&self, tenant_id: i64, id: i64) -> Result<SessionRecord> {
        let record = self.get_owned(tenant_id, id).await?;
        let Some(handle) = record.container_id.clone() else {
            return Ok(record);
        };

        self.orchestrator.stop_session(&handle).await?;
        if !self.repo.clear_handle(id, &handle).await? {
            info!(
                "session {} moved on from {} while stopping; keeping newer handle",
                id, handle
            );
        }

        self.get_owned(tenant_id, id).await
    }

    /// Run a shell command in the session's sandbox.
    pub async fn exec(&self, tenant_id: i64, id: i64, command: &str) -> Result<String> {
        let handle = self.running_handle(tenant_id, id).await?;
        self.repo.touch_activity(id).await?;
        Ok(self.orchestrator.exec_command(&handle, command).await?)
    }

    /// Resource snapshot; counts as activity.
    pub async fn stats(&self, tenant_id: i64, id: i64) -> Result<ContainerStats> {
        let handle = self.running_handle(tenant_id, id).await?;
        self.repo.touch_activity(id).await?;
        Ok(self.orchestrator.stats(&handle).await?)
    }

    /// Check that `tenant_id` may open a terminal on session `id` and return
    /// the sandbox handle to attach to.
    pub async fn authorize_terminal(&self, tenant_id: i64, id: i64) -> Result<String> {
        self.running_handle(tenant_id, id).await
    }

    pub async fn open_terminal(&self, handle: &str) -> Result<ExecChannel> {
        Ok(self.orchestrator.open_interactive_channel(handle).await?)
    }

    /// Activity sink for a terminal bridge on session `id`.
    pub fn activity_recorder(&self, id: i64) -> SessionActivity {
        SessionActivity {
            repo: self.repo.clone(),
            session_id: id,
        }
    }

    async fn running_handle(&self, tenant_id: i64, id: i64) -> Result<String> {
        let record = self.get_owned(tenant_id, id).await?;
        match record.container_id {
            Some(handle) => Ok(handle),
            None => anyhow::bail!("session {} is not running", id),
        }
    }
}

/// Records terminal heartbeats against one session record.
#[derive(Debug, Clone)]
pub struct SessionActivity {
    repo: SessionRepository,
    session_id: i64,
}

#[async_trait]
impl ActivityRecorder for SessionActivity {
    async fn record_activity(&self) -> Result<()> {
        self.repo.touch_activity(self.session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sandbox::testing::FakeRuntime;
    use crate::sandbox::{ContainerRuntimeApi, SandboxError, SandboxLimits, WorkspaceResolver};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        service: SessionService,
        runtime: Arc<FakeRuntime>,
        _root: TempDir,
    }

    async fn fixture() -> Fixture {
        let root = tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let orchestrator = SandboxOrchestrator::new(
            Some(runtime.clone() as Arc<dyn ContainerRuntimeApi>),
            WorkspaceResolver::new(root.path()),
            SandboxLimits::default(),
        );
        let db = Database::in_memory().await.unwrap();
        let mut config = SessionServiceConfig::default();
        config
            .extra_env
            .insert("ANTHROPIC_API_KEY".to_string(), "sk-test".to_string());
        let service = SessionService::new(
            SessionRepository::new(db.pool().clone()),
            Arc::new(orchestrator),
            config,
        );
        Fixture {
            service,
            runtime,
            _root: root,
        }
    }

    #[tokio::test]
    async fn test_start_records_handle() {
        let f = fixture().await;
        let record = f.service.create_session(1, "demo").await.unwrap();

        let started = f.service.start_session(1, record.id).await.unwrap();
        let handle = started.container_id.clone().unwrap();
        assert!(f.runtime.is_running(&handle));
        assert_eq!(started.generation, 1);

        let config = &f.runtime.created_configs()[0];
        assert_eq!(config.image, DEFAULT_IMAGE);
        assert_eq!(config.command, vec!["tail", "-f", "/dev/null"]);
        assert_eq!(config.env.get("ANTHROPIC_API_KEY").unwrap(), "sk-test");
    }

    #[tokio::test]
    async fn test_start_with_handle_returns_record_unchanged() {
        let f = fixture().await;
        let record = f.service.create_session(1, "demo").await.unwrap();
        let first = f.service.start_session(1, record.id).await.unwrap();
        let second = f.service.start_session(1, record.id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.runtime.created_configs().len(), 1);
    }

    #[tokio::test]
    async fn test_other_tenant_sees_not_found() {
        let f = fixture().await;
        let record = f.service.create_session(1, "demo").await.unwrap();

        let err = f.service.start_session(2, record.id).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(f.runtime.created_configs().is_empty());
    }

    #[tokio::test]
    async fn test_double_stop_is_idempotent() {
        let f = fixture().await;
        let record = f.service.create_session(1, "demo").await.unwrap();
        let started = f.service.start_session(1, record.id).await.unwrap();
        let handle = started.container_id.unwrap();

        let stopped = f.service.stop_session(1, record.id).await.unwrap();
        assert!(stopped.container_id.is_none());
        assert!(!f.runtime.exists(&handle));

        let again = f.service.stop_session(1, record.id).await.unwrap();
        assert_eq!(again, stopped);
        assert_eq!(f.runtime.stop_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_after_out_of_band_removal() {
        let f = fixture().await;
        let record = f.service.create_session(1, "demo").await.unwrap();
        let handle = f
            .service
            .start_session(1, record.id)
            .await
            .unwrap()
            .container_id
            .unwrap();

        f.runtime.remove_out_of_band(&handle);
        let stopped = f.service.stop_session(1, record.id).await.unwrap();
        assert!(stopped.container_id.is_none());
    }

    #[tokio::test]
    async fn test_exec_and_stats_require_running() {
        let f = fixture().await;
        let record = f.service.create_session(1, "demo").await.unwrap();

        let err = f.service.exec(1, record.id, "ls").await.unwrap_err();
        assert!(err.to_string().contains("not running"));
        assert!(f.service.stats(1, record.id).await.is_err());
    }

    #[tokio::test]
    async fn test_exec_returns_output() {
        let f = fixture().await;
        let record = f.service.create_session(1, "demo").await.unwrap();
        f.service.start_session(1, record.id).await.unwrap();
        f.runtime.set_exec_output(b"hello\n".to_vec());

        let output = f.service.exec(1, record.id, "echo hello").await.unwrap();
        assert_eq!(output, "hello\n");
    }

    #[tokio::test]
    async fn test_exec_on_vanished_handle_surfaces_handle_not_found() {
        let f = fixture().await;
        let record = f.service.create_session(1, "demo").await.unwrap();
        let handle = f
            .service
            .start_session(1, record.id)
            .await
            .unwrap()
            .container_id
            .unwrap();
        f.runtime.remove_out_of_band(&handle);

        let err = f.service.exec(1, record.id, "ls").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SandboxError>(),
            Some(SandboxError::HandleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_refreshes_activity() {
        let f = fixture().await;
        let record = f.service.create_session(1, "demo").await.unwrap();
        f.service.start_session(1, record.id).await.unwrap();
        let past = chrono::Utc::now() - chrono::Duration::hours(3);
        f.service
            .repository()
            .set_last_activity(record.id, past)
            .await
            .unwrap();

        let stats = f.service.stats(1, record.id).await.unwrap();
        assert!(stats.pids > 0);

        let touched = f.service.get_owned(1, record.id).await.unwrap();
        assert!(touched.last_activity().unwrap() > past + chrono::Duration::hours(2));
    }

    #[tokio::test]
    async fn test_concurrent_starts_last_writer_wins() {
        let f = fixture().await;
        let record = f.service.create_session(1, "demo").await.unwrap();

        let (a, b) = tokio::join!(
            f.service.start_session(1, record.id),
            f.service.start_session(1, record.id),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let current = f.service.get_owned(1, record.id).await.unwrap();
        let handle = current.container_id.clone().unwrap();
        assert!(handle == a.container_id.clone().unwrap() || handle == b.container_id.clone().unwrap());
        assert!(f.runtime.is_running(&handle));
    }

    #[tokio::test]
    async fn test_authorize_terminal() {
        let f = fixture().await;
        let record = f.service.create_session(1, "demo").await.unwrap();
        assert!(f.service.authorize_terminal(1, record.id).await.is_err());

        let handle = f
            .service
            .start_session(1, record.id)
            .await
            .unwrap()
            .container_id
            .unwrap();
        assert_eq!(f.service.authorize_terminal(1, record.id).await.unwrap(), handle);
        assert!(f.service.authorize_terminal(2, record.id).await.is_err());
    }

    #[tokio::test]
    async fn test_create_rejects_blank_name() {
        let f = fixture().await;
        let err = f.service.create_session(1, "  ").await.unwrap_err();
        assert!(err.to_string().contains("must be"));
    }
}
