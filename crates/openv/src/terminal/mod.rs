//! Interactive terminal sessions into running sandboxes.

mod bridge;

use async_trait::async_trait;

pub use bridge::{BridgeExit, DEFAULT_HEARTBEAT, run_bridge};

/// Sink for "this session is in use" signals from a live terminal.
#[async_trait]
pub trait ActivityRecorder: Send + Sync {
    async fn record_activity(&self) -> anyhow::Result<()>;
}
