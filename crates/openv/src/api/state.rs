//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthState;
use crate::session::SessionService;
use crate::terminal::DEFAULT_HEARTBEAT;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    pub auth: AuthState,
    /// Interval between terminal activity heartbeats.
    pub heartbeat: Duration,
}

impl AppState {
    pub fn new(sessions: Arc<SessionService>, auth: AuthState) -> Self {
        Self {
            sessions,
            auth,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}
