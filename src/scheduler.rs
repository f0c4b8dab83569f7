//! Recurring background work: token refresh and inbox sync for every
//! connected account.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Pacing;
use crate::db::models::TokenStatus;
use crate::db::Database;
use crate::inbound::InboundSyncEngine;
use crate::tokens::{RefreshSummary, TokenRefresher};

pub const SYNC_BATCH_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAllSummary {
    pub success: usize,
    pub failed: usize,
    pub total: usize,
    pub new_emails: usize,
}

/// The two jobs the scheduler drives. Manual triggers call the same methods.
#[async_trait]
pub trait BackgroundJobs: Send + Sync {
    async fn refresh_tokens(&self) -> Result<RefreshSummary>;

    async fn sync_all_users(&self) -> Result<SyncAllSummary>;
}

/// Production jobs backed by the token refresher and the sync engine.
pub struct MailJobs {
    db: Arc<Database>,
    tokens: Arc<TokenRefresher>,
    engine: Arc<InboundSyncEngine>,
    pacing: Pacing,
    hours_back: u32,
}

impl MailJobs {
    pub fn new(
        db: Arc<Database>,
        tokens: Arc<TokenRefresher>,
        engine: Arc<InboundSyncEngine>,
        pacing: Pacing,
        hours_back: u32,
    ) -> Self {
        Self {
            db,
            tokens,
            engine,
            pacing,
            hours_back,
        }
    }

    /// Users with at least one active token, in a stable order.
    fn users_to_sync(&self) -> Result<Vec<String>> {
        let mut users: Vec<String> = self
            .db
            .tokens_with_status(TokenStatus::Active)
            .context("load active tokens")?
            .into_iter()
            .map(|token| token.user_id)
            .collect();
        users.dedup();
        Ok(users)
    }
}

#[async_trait]
impl BackgroundJobs for MailJobs {
    async fn refresh_tokens(&self) -> Result<RefreshSummary> {
        self.tokens.refresh_all_tokens().await
    }

    async fn sync_all_users(&self) -> Result<SyncAllSummary> {
        let users = self.users_to_sync()?;
        let mut summary = SyncAllSummary {
            total: users.len(),
            ..SyncAllSummary::default()
        };
        if users.is_empty() {
            debug!("no connected gmail accounts to sync");
            return Ok(summary);
        }

        let batches: Vec<&[String]> = users.chunks(SYNC_BATCH_SIZE).collect();
        let batch_count = batches.len();
        for (index, batch) in batches.into_iter().enumerate() {
            let results = join_all(
                batch
                    .iter()
                    .map(|user_id| self.engine.sync_recent_emails(user_id, self.hours_back)),
            )
            .await;
            for result in results {
                if result.success {
                    summary.success += 1;
                    summary.new_emails += result.new_emails;
                } else {
                    summary.failed += 1;
                }
            }

            if index + 1 < batch_count && !self.pacing.sync_batch_pause.is_zero() {
                sleep(self.pacing.sync_batch_pause).await;
            }
        }

        info!(
            success = summary.success,
            failed = summary.failed,
            total = summary.total,
            new_emails = summary.new_emails,
            "sync pass complete"
        );
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTimings {
    pub refresh_interval: Duration,
    pub refresh_initial_delay: Duration,
    pub sync_interval: Duration,
    pub sync_initial_delay: Duration,
}

impl Default for ScheduleTimings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30 * 60),
            refresh_initial_delay: Duration::from_secs(30),
            sync_interval: Duration::from_secs(5 * 60),
            sync_initial_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Refresh,
    Sync,
}

impl Job {
    fn name(self) -> &'static str {
        match self {
            Job::Refresh => "token-refresh",
            Job::Sync => "gmail-sync",
        }
    }
}

struct JobHandle {
    cancel: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Owns the recurring job tasks. `start` and `stop` are idempotent and a
/// stopped scheduler can be started again.
pub struct Scheduler {
    jobs: Arc<dyn BackgroundJobs>,
    timings: ScheduleTimings,
    running: Mutex<Vec<JobHandle>>,
}

impl Scheduler {
    pub fn new(jobs: Arc<dyn BackgroundJobs>) -> Self {
        Self::with_timings(jobs, ScheduleTimings::default())
    }

    pub fn with_timings(jobs: Arc<dyn BackgroundJobs>, timings: ScheduleTimings) -> Self {
        Self {
            jobs,
            timings,
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        match self.running.lock() {
            Ok(running) if !running.is_empty() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Spawn both jobs. Returns `false` if already running.
    pub fn start(&self) -> bool {
        let Ok(mut running) = self.running.lock() else {
            warn!("scheduler state lock poisoned, not starting");
            return false;
        };
        if !running.is_empty() {
            debug!("scheduler already running");
            return false;
        }

        running.push(self.spawn(
            Job::Refresh,
            self.timings.refresh_initial_delay,
            self.timings.refresh_interval,
        ));
        running.push(self.spawn(
            Job::Sync,
            self.timings.sync_initial_delay,
            self.timings.sync_interval,
        ));
        info!(
            refresh_every_secs = self.timings.refresh_interval.as_secs(),
            sync_every_secs = self.timings.sync_interval.as_secs(),
            "scheduler started"
        );
        true
    }

    /// Cancel both jobs, aborting any run in progress, and wait for the job
    /// loops to exit. Returns `false` if nothing was running.
    pub async fn stop(&self) -> bool {
        let handles = match self.running.lock() {
            Ok(mut running) => std::mem::take(&mut *running),
            Err(_) => {
                warn!("scheduler state lock poisoned, nothing to stop");
                return false;
            }
        };
        if handles.is_empty() {
            return false;
        }

        let mut joins = Vec::with_capacity(handles.len());
        for handle in handles {
            let _ = handle.cancel.send(());
            joins.push(handle.join);
        }
        for join in joins {
            let _ = join.await;
        }
        info!("scheduler stopped");
        true
    }

    pub async fn run_refresh_now(&self) -> Result<RefreshSummary> {
        self.jobs.refresh_tokens().await
    }

    pub async fn run_sync_now(&self) -> Result<SyncAllSummary> {
        self.jobs.sync_all_users().await
    }

    fn spawn(&self, job: Job, initial_delay: Duration, period: Duration) -> JobHandle {
        let (cancel, mut cancelled) = oneshot::channel::<()>();
        let jobs = Arc::clone(&self.jobs);

        let join = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancelled => break,
                    _ = ticker.tick() => {}
                }

                // A panicking tick only takes down its own task.
                let mut run = tokio::spawn(run_job(Arc::clone(&jobs), job));
                let stop = tokio::select! {
                    biased;
                    _ = &mut cancelled => true,
                    outcome = &mut run => {
                        if let Err(error) = outcome {
                            error!(job = job.name(), "job aborted: {error}");
                        }
                        false
                    }
                };
                if stop {
                    run.abort();
                    break;
                }
            }
            debug!(job = job.name(), "job loop exited");
        });

        JobHandle { cancel, join }
    }
}

async fn run_job(jobs: Arc<dyn BackgroundJobs>, job: Job) {
    match job {
        Job::Refresh => match jobs.refresh_tokens().await {
            Ok(summary) => debug!(
                job = job.name(),
                success = summary.success,
                failed = summary.failed,
                "job finished"
            ),
            Err(error) => warn!(job = job.name(), "job failed: {error:#}"),
        },
        Job::Sync => match jobs.sync_all_users().await {
            Ok(summary) => debug!(
                job = job.name(),
                success = summary.success,
                failed = summary.failed,
                "job finished"
            ),
            Err(error) => warn!(job = job.name(), "job failed: {error:#}"),
        },
    }
}
