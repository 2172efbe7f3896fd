//! Session record models.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Intended state of a session's sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No sandbox is expected to exist.
    #[default]
    Idle,
    /// A sandbox was started and its handle recorded.
    Running,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Running => write!(f, "running"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(SessionStatus::Idle),
            "running" => Ok(SessionStatus::Running),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Persisted projection of a project session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    /// Session id.
    pub id: i64,
    /// Owning tenant.
    pub tenant_id: i64,
    /// Project name, used for the container name and `PROJECT_NAME`.
    pub name: String,
    /// Engine handle while a sandbox is intended to run.
    pub container_id: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Bumped on every start; reconciler writes only apply to the
    /// generation they observed.
    pub generation: i64,
    /// RFC 3339, UTC.
    pub last_activity_at: String,
    pub created_at: String,
}

impl SessionRecord {
    pub fn is_running(&self) -> bool {
        self.container_id.is_some()
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.last_activity_at)
    }

    /// Idle for longer than `timeout` at `now`. Unparseable timestamps count
    /// as idle.
    pub fn is_idle_at(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        match self.last_activity() {
            Some(last) => now.signed_duration_since(last) > timeout,
            None => true,
        }
    }
}

/// Fixed-width RFC 3339 so timestamps also sort lexically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Request to create a session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
}

/// Request to run a command in a session's sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
}

/// Output of a completed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    pub output: String,
}
