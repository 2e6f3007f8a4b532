//! Job orchestrator: the worker polling loop.
//!
//! Each poll cycle either advances exactly one job or changes nothing:
//!
//! 1. [`ResourceGuard`] checks disk headroom, the global running-job ceiling
//!    and the deploy lock. If any fails the cycle is skipped.
//! 2. Eligible jobs are read in pick order and claimed with a
//!    compare-and-set to `running`. A lost claim moves on to the next
//!    candidate.
//! 3. The [`CaptureSupervisor`] runs to completion (or until the job is
//!    moved out of `running` by someone else) and its disposition decides
//!    the next status. A successful capture is indexed in the same
//!    control flow.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{Config, IndexingConfig, WorkerConfig};
use crate::coordination::DeployLock;
use crate::db;
use crate::jobs::{Changes, JobStore};
use crate::models::{Actor, Job, JobStatus};
use crate::pipeline;
use crate::supervisor::{CaptureDisposition, CaptureSupervisor, ProcessSupervisor};

const PICK_BATCH: i64 = 16;
const PICK_ROUNDS: usize = 3;

/// Why a poll cycle did nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    DiskLow { available: u64, required: u64 },
    AtCapacity { running: i64, limit: i64 },
    DeployLocked,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::DiskLow {
                available,
                required,
            } => write!(f, "disk headroom {} < {} bytes", available, required),
            SkipReason::AtCapacity { running, limit } => {
                write!(f, "{} running jobs (limit {})", running, limit)
            }
            SkipReason::DeployLocked => f.write_str("deploy lock held"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Skipped(SkipReason),
    Idle,
    Ran { job_id: String, status: JobStatus },
}

/// Pre-pick safety checks.
pub struct ResourceGuard {
    output_root: PathBuf,
    min_free_disk_bytes: u64,
    max_running_jobs: i64,
    deploy_lock: DeployLock,
}

impl ResourceGuard {
    pub fn new(settings: &WorkerConfig, deploy_lock: DeployLock) -> Self {
        Self {
            output_root: settings.output_root.clone(),
            min_free_disk_bytes: settings.min_free_disk_bytes,
            max_running_jobs: settings.max_running_jobs,
            deploy_lock,
        }
    }

    pub async fn check(&self, store: &JobStore, now: DateTime<Utc>) -> Result<Option<SkipReason>> {
        if self.deploy_lock.is_held(now)? {
            return Ok(Some(SkipReason::DeployLocked));
        }

        let running = store.count_in_status(JobStatus::Running).await?;
        if running >= self.max_running_jobs {
            return Ok(Some(SkipReason::AtCapacity {
                running,
                limit: self.max_running_jobs,
            }));
        }

        if self.min_free_disk_bytes > 0 {
            match available_space(&self.output_root) {
                Some(available) if available < self.min_free_disk_bytes => {
                    return Ok(Some(SkipReason::DiskLow {
                        available,
                        required: self.min_free_disk_bytes,
                    }));
                }
                Some(_) => {}
                None => {
                    debug!(output_root = %self.output_root.display(), "no disk found for output root, skipping headroom check")
                }
            }
        }

        Ok(None)
    }
}

/// Free space on the filesystem holding `path` (longest mount-point match).
pub fn available_space(path: &Path) -> Option<u64> {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

pub struct Orchestrator {
    store: JobStore,
    supervisor: Box<dyn CaptureSupervisor>,
    guard: ResourceGuard,
    settings: WorkerConfig,
    indexing: IndexingConfig,
}

impl Orchestrator {
    pub fn new(
        store: JobStore,
        supervisor: Box<dyn CaptureSupervisor>,
        guard: ResourceGuard,
        settings: WorkerConfig,
        indexing: IndexingConfig,
    ) -> Self {
        Self {
            store,
            supervisor,
            guard,
            settings,
            indexing,
        }
    }

    pub fn from_config(config: &Config, store: JobStore, supervisor: Box<dyn CaptureSupervisor>) -> Self {
        let lock = DeployLock::new(
            config.recovery.deploy_lock(),
            config.recovery.deploy_lock_max_age_secs,
        );
        Self::new(
            store,
            supervisor,
            ResourceGuard::new(&config.worker, lock),
            config.worker.clone(),
            config.indexing.clone(),
        )
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Run one poll cycle as of `now`.
    pub async fn poll_at(&self, now: DateTime<Utc>) -> Result<PollOutcome> {
        if let Some(reason) = self.guard.check(&self.store, now).await? {
            info!(reason = %reason, "skipping poll cycle");
            return Ok(PollOutcome::Skipped(reason));
        }

        let Some(job) = self.claim_next(now).await? else {
            debug!("no eligible jobs");
            return Ok(PollOutcome::Idle);
        };

        let disposition = self.supervisor.run(&job, &self.store).await;
        let status = self.apply_disposition(&job, disposition).await?;

        Ok(PollOutcome::Ran {
            job_id: job.id,
            status,
        })
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        for _ in 0..PICK_ROUNDS {
            let candidates = self.store.pick_candidates(now, PICK_BATCH).await?;
            if candidates.is_empty() {
                return Ok(None);
            }
            for candidate in candidates {
                if !candidate.status.is_pickable() {
                    continue;
                }
                let claimed = self
                    .store
                    .transition(
                        &candidate.id,
                        candidate.status,
                        JobStatus::Running,
                        Actor::Orchestrator,
                        Changes {
                            started_at: Some(now),
                            cooldown_until: Some(None),
                            exit_code: Some(None),
                            ..Default::default()
                        },
                        Some(&format!("attempt {}", candidate.retry_count + 1)),
                        now,
                    )
                    .await?;
                if !claimed {
                    continue;
                }
                if let Some(job) = self.store.get_job(&candidate.id).await? {
                    return Ok(Some(job));
                }
            }
        }
        Ok(None)
    }

    async fn apply_disposition(&self, job: &Job, disposition: CaptureDisposition) -> Result<JobStatus> {
        let now = Utc::now();
        match disposition {
            CaptureDisposition::Success { progress } => {
                let moved = self
                    .store
                    .transition(
                        &job.id,
                        JobStatus::Running,
                        JobStatus::Completed,
                        Actor::Orchestrator,
                        Changes {
                            exit_code: Some(Some(0)),
                            finished_at: Some(now),
                            last_error: Some(None),
                            progress,
                            ..Default::default()
                        },
                        None,
                        now,
                    )
                    .await?;
                if !moved {
                    return self.lost_race(job).await;
                }

                let Some(completed) = self.store.get_job(&job.id).await? else {
                    anyhow::bail!("job {} vanished after capture", job.id);
                };
                let (status, _) =
                    pipeline::index_and_record(&self.store, &completed, &self.indexing, Actor::Indexer)
                        .await?;
                Ok(status)
            }
            CaptureDisposition::CaptureFailure { exit_code, detail } => {
                let attempts = job.retry_count + 1;
                let to = if attempts < job.max_retries {
                    JobStatus::Retryable
                } else {
                    JobStatus::Failed
                };
                let moved = self
                    .store
                    .transition(
                        &job.id,
                        JobStatus::Running,
                        to,
                        Actor::Orchestrator,
                        Changes {
                            increment_retry: true,
                            exit_code: Some(exit_code),
                            last_error: Some(Some(detail.clone())),
                            finished_at: Some(now),
                            ..Default::default()
                        },
                        Some(&format!("capture failure {}/{}: {}", attempts, job.max_retries, detail)),
                        now,
                    )
                    .await?;
                if !moved {
                    return self.lost_race(job).await;
                }
                if to == JobStatus::Failed {
                    error!(job_id = %job.id, retry_count = attempts, "job failed after exhausting retries");
                }
                Ok(to)
            }
            CaptureDisposition::InfrastructureFailure { kind, detail } => {
                let until = now + Duration::seconds(self.settings.infra_cooldown_secs);
                let message = format!("{}: {}", kind, detail);
                let moved = self
                    .store
                    .transition(
                        &job.id,
                        JobStatus::Running,
                        JobStatus::Retryable,
                        Actor::Orchestrator,
                        Changes {
                            cooldown_until: Some(Some(until)),
                            last_error: Some(Some(message.clone())),
                            ..Default::default()
                        },
                        Some(&format!("infrastructure failure, cooling down until {}", until.to_rfc3339())),
                        now,
                    )
                    .await?;
                if !moved {
                    return self.lost_race(job).await;
                }
                Ok(JobStatus::Retryable)
            }
            CaptureDisposition::Released { status } => {
                debug!(job_id = %job.id, status = %status, "capture stopped after the job was released");
                self.lost_race(job).await
            }
        }
    }

    /// The job left `running` while the capture was in progress, most likely
    /// through a forced recovery. Report what is stored and change nothing.
    async fn lost_race(&self, job: &Job) -> Result<JobStatus> {
        let current = self.store.get_job(&job.id).await?;
        let status = current.map(|j| j.status).unwrap_or(JobStatus::Running);
        warn!(job_id = %job.id, status = %status, "job left running during capture; outcome discarded");
        Ok(status)
    }

    /// Poll until Ctrl-C, or once when `once` is set. Shutdown is only
    /// honoured between cycles.
    pub async fn run(&self, once: bool) -> Result<()> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    let _ = stop_tx.send(true);
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                    // Dropping the sender would end the loop
                    std::future::pending::<()>().await;
                }
            }
        });

        let interval = std::time::Duration::from_secs(self.settings.poll_interval_secs);
        info!(poll_interval_secs = self.settings.poll_interval_secs, "worker started");

        loop {
            match self.poll_at(Utc::now()).await {
                Ok(outcome) => {
                    if once {
                        print_outcome(&outcome);
                        return Ok(());
                    }
                    if let PollOutcome::Ran { job_id, status } = &outcome {
                        info!(job_id = %job_id, status = %status, "poll cycle finished");
                    }
                }
                Err(e) if once => return Err(e),
                Err(e) => error!(error = %e, "poll cycle failed"),
            }

            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("worker stopped");
        Ok(())
    }
}

fn print_outcome(outcome: &PollOutcome) {
    match outcome {
        PollOutcome::Skipped(reason) => println!("skipped: {}", reason),
        PollOutcome::Idle => println!("idle: no eligible jobs"),
        PollOutcome::Ran { job_id, status } => println!("{} -> {}", job_id, status),
    }
}

/// CLI entry point for `arh worker`.
pub async fn run_worker(config: &Config, once: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = JobStore::new(pool.clone());
    let supervisor = Box::new(ProcessSupervisor::new(config.capture.clone()));
    let orchestrator = Orchestrator::from_config(config, store, supervisor);

    let result = orchestrator.run(once).await;
    pool.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_space_resolves_root() {
        // Every Linux host has a filesystem mounted at or above /tmp
        let found = available_space(Path::new("/tmp"));
        if let Some(bytes) = found {
            assert!(bytes > 0);
        }
    }

    #[test]
    fn skip_reasons_render() {
        assert_eq!(
            SkipReason::AtCapacity { running: 2, limit: 1 }.to_string(),
            "2 running jobs (limit 1)"
        );
        assert_eq!(SkipReason::DeployLocked.to_string(), "deploy lock held");
    }
}
