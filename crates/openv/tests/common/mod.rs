//! Test utilities and common setup.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use openv::api::{self, AppState};
use openv::auth::{AuthConfig, AuthState};
use openv::db::Database;
use openv::sandbox::testing::FakeRuntime;
use openv::sandbox::{ContainerRuntimeApi, SandboxLimits, SandboxOrchestrator, WorkspaceResolver};
use openv::session::{
    Reconciler, ReconcilerSettings, SessionRepository, SessionService, SessionServiceConfig,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

pub const JWT_SECRET: &str = "test-secret-for-integration-tests-minimum-32-chars";

/// A fully wired application over an in-memory database.
pub struct TestApp {
    pub router: Router,
    pub runtime: Arc<FakeRuntime>,
    pub reconciler: Reconciler,
    pub auth: AuthState,
    pub root: TempDir,
}

fn test_auth_config() -> AuthConfig {
    AuthConfig {
        jwt_secret: Some(JWT_SECRET.to_string()),
        ..Default::default()
    }
}

async fn build(runtime: Option<Arc<FakeRuntime>>) -> TestApp {
    let root = tempfile::tempdir().expect("create workspace root");
    let fake = runtime.clone().unwrap_or_default();
    let engine = runtime.map(|r| r as Arc<dyn ContainerRuntimeApi>);

    let orchestrator = Arc::new(SandboxOrchestrator::new(
        engine,
        WorkspaceResolver::new(root.path()),
        SandboxLimits::default(),
    ));
    let db = Database::in_memory().await.expect("open in-memory database");
    let repo = SessionRepository::new(db.pool().clone());

    let sessions = Arc::new(SessionService::new(
        repo.clone(),
        orchestrator.clone(),
        SessionServiceConfig::default(),
    ));
    let reconciler = Reconciler::new(orchestrator, repo, ReconcilerSettings::default());

    let auth = AuthState::new(test_auth_config());
    let router = api::create_router(AppState::new(sessions, auth.clone()));

    TestApp {
        router,
        runtime: fake,
        reconciler,
        auth,
        root,
    }
}

/// App backed by a fake engine.
pub async fn test_app() -> TestApp {
    build(Some(Arc::new(FakeRuntime::default()))).await
}

/// App whose engine client could not be constructed.
pub async fn test_app_without_engine() -> TestApp {
    build(None).await
}

impl TestApp {
    pub fn token(&self, tenant_id: i64) -> String {
        self.auth
            .generate_token(tenant_id, 3600)
            .expect("generate test token")
    }

    /// Send a request as `tenant_id` and decode the JSON body.
    pub async fn request(
        &self,
        tenant_id: i64,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.token(tenant_id)),
            );

        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    /// Create a project for `tenant_id` and return its id.
    pub async fn create_project(&self, tenant_id: i64, name: &str) -> i64 {
        let (status, json) = self
            .request(
                tenant_id,
                Method::POST,
                "/projects",
                Some(serde_json::json!({ "name": name })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create failed: {json}");
        json["id"].as_i64().unwrap()
    }

    /// Serve the router on an ephemeral local port.
    pub async fn spawn_server(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = self.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }
}
