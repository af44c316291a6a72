//! Cron-style job scheduler.
//!
//! Exactly three default jobs: nightly decay at 02:00, pattern detection
//! every six hours, and full consolidation at 03:00. One task per job, so a
//! run in progress blocks the next firing of the same job; failures are
//! logged and never take the daemon down.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use claudia_core::ConsolidateService;

/// What a job does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Decay,
    PatternDetection,
    FullConsolidation,
}

impl JobKind {
    fn id(&self) -> &'static str {
        match self {
            JobKind::Decay => "daily_decay",
            JobKind::PatternDetection => "pattern_detection",
            JobKind::FullConsolidation => "full_consolidation",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            JobKind::Decay => "Nightly importance decay",
            JobKind::PatternDetection => "Pattern detection sweep",
            JobKind::FullConsolidation => "Full consolidation",
        }
    }

    /// Six-field cron expression (seconds first)
    fn cron(&self) -> &'static str {
        match self {
            JobKind::Decay => "0 0 2 * * *",
            JobKind::PatternDetection => "0 0 */6 * * *",
            JobKind::FullConsolidation => "0 0 3 * * *",
        }
    }

    async fn run(&self, consolidate: &ConsolidateService) -> claudia_core::Result<()> {
        match self {
            JobKind::Decay => {
                consolidate.decay()?;
            }
            JobKind::PatternDetection => {
                consolidate.detect_patterns()?;
            }
            JobKind::FullConsolidation => {
                consolidate.consolidate().await?;
            }
        }
        Ok(())
    }
}

/// Live view of one scheduled job, surfaced by `/status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: String,
    pub name: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub running: bool,
}

/// Shared, read-only view of scheduler state
pub type SchedulerStatus = Arc<RwLock<Vec<JobStatus>>>;

/// Cooperative cron scheduler over the consolidation service
pub struct Scheduler {
    consolidate: Arc<ConsolidateService>,
    status: SchedulerStatus,
}

impl Scheduler {
    pub fn new(consolidate: Arc<ConsolidateService>) -> Self {
        Self {
            consolidate,
            status: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Handle for status reporting; valid before and after `spawn`.
    pub fn status(&self) -> SchedulerStatus {
        self.status.clone()
    }

    /// Spawn every job as its own task. Jobs stop when `shutdown` flips.
    pub async fn spawn(&self, shutdown: watch::Receiver<bool>) {
        let kinds = [
            JobKind::Decay,
            JobKind::PatternDetection,
            JobKind::FullConsolidation,
        ];

        {
            let mut status = self.status.write().await;
            status.clear();
            for kind in &kinds {
                let schedule =
                    Schedule::from_str(kind.cron()).expect("default cron expressions parse");
                status.push(JobStatus {
                    id: kind.id().to_string(),
                    name: kind.name().to_string(),
                    next_run: schedule.upcoming(Utc).next(),
                    last_run: None,
                    running: false,
                });
            }
        }

        for (index, kind) in kinds.into_iter().enumerate() {
            let consolidate = self.consolidate.clone();
            let status = self.status.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let schedule =
                    Schedule::from_str(kind.cron()).expect("default cron expressions parse");
                info!(job = kind.id(), cron = kind.cron(), "job scheduled");

                loop {
                    let Some(next) = schedule.upcoming(Utc).next() else {
                        warn!(job = kind.id(), "no further occurrences; job retires");
                        return;
                    };
                    {
                        let mut status = status.write().await;
                        if let Some(slot) = status.get_mut(index) {
                            slot.next_run = Some(next);
                        }
                    }

                    let wait = (next - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.changed() => {
                            info!(job = kind.id(), "scheduler job stopping");
                            return;
                        }
                    }

                    {
                        let mut status = status.write().await;
                        if let Some(slot) = status.get_mut(index) {
                            slot.running = true;
                        }
                    }
                    let started = Utc::now();
                    match kind.run(&consolidate).await {
                        Ok(()) => info!(job = kind.id(), "scheduled job complete"),
                        Err(e) => error!(job = kind.id(), "scheduled job failed: {}", e),
                    }
                    {
                        let mut status = status.write().await;
                        if let Some(slot) = status.get_mut(index) {
                            slot.running = false;
                            slot.last_run = Some(started);
                        }
                    }
                }
            });
        }
    }
}
