//! Background reconciliation between session records and the engine.
//!
//! Each cycle snapshots engine reality first and the records second. It
//! removes orphaned containers, clears handles whose container vanished or
//! stopped running, evicts idle sandboxes and commits every record correction
//! in one transaction.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::sandbox::SandboxOrchestrator;

use super::repository::{Reset, SessionRepository};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Time between cycles. The first cycle runs one interval after start.
    pub interval: Duration,
    /// Sandboxes idle for longer than this are stopped.
    pub idle_timeout: Duration,
    /// Unrecorded containers younger than this are left for the next cycle.
    pub orphan_grace: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(60 * 60),
            orphan_grace: Duration::from_secs(60),
        }
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub orphans_removed: usize,
    pub orphans_failed: usize,
    pub desynced: usize,
    pub evicted: usize,
    pub eviction_failures: usize,
    /// Corrections that no longer applied at commit time.
    pub stale_skipped: usize,
}

impl CycleReport {
    pub fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reconciler {
    orchestrator: Arc<SandboxOrchestrator>,
    repo: SessionRepository,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        orchestrator: Arc<SandboxOrchestrator>,
        repo: SessionRepository,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            orchestrator,
            repo,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Run one cycle. Errors while snapshotting or committing abort the
    /// cycle without writing anything; per-container engine failures are
    /// logged and counted.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        // Taken before listing: anything recorded later may be missing
        // from the listing.
        let observed_at = Utc::now();
        let reality = self
            .orchestrator
            .list_managed()
            .await
            .context("listing managed containers")?;
        let intent = self
            .repo
            .list_with_handle()
            .await
            .context("listing session records with a handle")?;

        let running: HashSet<&str> = reality
            .iter()
            .filter(|c| c.is_running())
            .map(|c| c.id.as_str())
            .collect();
        let claimed: HashSet<&str> = intent
            .iter()
            .filter_map(|r| r.container_id.as_deref())
            .collect();

        let claimed_exited: HashSet<&str> = reality
            .iter()
            .filter(|c| !c.is_running() && claimed.contains(c.id.as_str()))
            .map(|c| c.id.as_str())
            .collect();

        let grace = chrono::Duration::from_std(self.settings.orphan_grace)
            .unwrap_or(chrono::Duration::zero());
        for container in reality.iter().filter(|c| !claimed.contains(c.id.as_str())) {
            let young = container
                .created_at
                .is_some_and(|created| observed_at.signed_duration_since(created) < grace);
            if young {
                debug!(
                    "skipping young unrecorded container {} ({})",
                    container.name, container.id
                );
                continue;
            }

            match self.orchestrator.stop_session(&container.id).await {
                Ok(()) => {
                    info!("removed orphan container {} ({})", container.name, container.id);
                    report.orphans_removed += 1;
                }
                Err(e) => {
                    warn!(
                        "failed to remove orphan container {} ({}): {}",
                        container.name, container.id, e
                    );
                    report.orphans_failed += 1;
                }
            }
        }

        let idle_timeout = chrono::Duration::from_std(self.settings.idle_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let mut resets = Vec::new();

        for record in &intent {
            let Some(reset) = Reset::from_record(record) else {
                continue;
            };

            if !running.contains(reset.container_id.as_str()) {
                // Started after the engine snapshot: its container is simply
                // not in the listing yet.
                if record.last_activity().is_some_and(|at| at > observed_at) {
                    debug!("session {} changed after snapshot; skipping", record.id);
                    continue;
                }
                info!(
                    "session {} lost its container {}; resetting",
                    record.id, reset.container_id
                );
                if claimed_exited.contains(reset.container_id.as_str()) {
                    // A failed removal leaves an orphan for the next cycle.
                    if let Err(e) = self.orchestrator.stop_session(&reset.container_id).await {
                        warn!(
                            "failed to remove exited container {}: {}",
                            reset.container_id, e
                        );
                    }
                }
                report.desynced += 1;
                resets.push(reset);
                continue;
            }

            if record.is_idle_at(Utc::now(), idle_timeout) {
                match self.orchestrator.stop_session(&reset.container_id).await {
                    Ok(()) => {
                        info!(
                            "evicted idle session {} (last activity {})",
                            record.id, record.last_activity_at
                        );
                        report.evicted += 1;
                        resets.push(reset);
                    }
                    Err(e) => {
                        warn!("failed to evict idle session {}: {}", record.id, e);
                        report.eviction_failures += 1;
                    }
                }
            }
        }

        let applied = self
            .repo
            .apply_resets(&resets)
            .await
            .context("committing reconcile corrections")?;
        report.stale_skipped = resets.len() - applied;

        Ok(report)
    }

    /// Run cycles every `interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        info!(
            "starting reconciler (every {}s, idle timeout {}s)",
            self.settings.interval.as_secs(),
            self.settings.idle_timeout.as_secs()
        );

        tokio::spawn(async move {
            let period = self.settings.interval;
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match self.run_cycle().await {
                    Ok(report) if report.is_quiet() => debug!("reconcile cycle: nothing to do"),
                    Ok(report) => info!("reconcile cycle: {:?}", report),
                    Err(e) => error!("reconcile cycle failed: {:#}", e),
                }
            }

            info!("reconciler stopped");
        })
    }
}
