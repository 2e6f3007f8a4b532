//! Recovery coordinator: forced `running → retryable` soft recoveries.
//!
//! Two detectors look at `running` jobs each cycle:
//!
//! - **stall**: no crawl progress (or no start) for `stall_after_mins`.
//! - **mount**: the job's output directory is unreachable (stale or
//!   disconnected mount, permission lost).
//!
//! A suspect is only acted on when all of these hold:
//!
//! 1. the same signal was seen on two consecutive cycles,
//! 2. the failure has lasted at least `min_failure_secs`,
//! 3. no fresh deploy lock is present,
//! 4. the per-job daily and global hourly budgets allow it.
//!
//! The transition itself is the usual compare-and-set with
//! [`Actor::Recovery`]; it leaves `retry_count` alone.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::path::Path;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RecoveryConfig};
use crate::coordination::{DeployLock, ObservationLog, RateLimiter};
use crate::db;
use crate::error::InfraErrorKind;
use crate::jobs::{Changes, JobStore};
use crate::models::{Actor, Job, JobStatus};

const MOUNT_CHECK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Stall,
    Mount,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Stall => "stall",
            SignalKind::Mount => "mount",
        }
    }
}

#[derive(Debug, Clone)]
struct Suspect {
    kind: SignalKind,
    /// Known start of the failure; `None` means "since first observed".
    failing_since: Option<DateTime<Utc>>,
    detail: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub running: usize,
    pub suspects: usize,
    pub recovered: Vec<String>,
    /// Waiting on debounce or the minimum failure duration.
    pub deferred: usize,
    pub rate_limited: usize,
    pub deploy_locked: bool,
}

pub struct RecoveryCoordinator {
    store: JobStore,
    settings: RecoveryConfig,
    deploy_lock: DeployLock,
}

impl RecoveryCoordinator {
    pub fn new(store: JobStore, settings: RecoveryConfig) -> Self {
        let deploy_lock = DeployLock::new(settings.deploy_lock(), settings.deploy_lock_max_age_secs);
        Self {
            store,
            settings,
            deploy_lock,
        }
    }

    /// Observe every running job once and act on confirmed suspects.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let running = self.store.list_jobs(Some(JobStatus::Running)).await?;
        let mut report = CycleReport {
            running: running.len(),
            ..Default::default()
        };

        // Load coordination state before acting; a corrupt file stops the cycle
        let mut observations = ObservationLog::load(&self.settings.state_dir)?;
        let mut limiter = RateLimiter::load(
            &self.settings.state_dir,
            self.settings.max_per_job_per_day,
            self.settings.max_global_per_hour,
        )?;

        let mut acted: HashSet<String> = HashSet::new();
        for job in &running {
            for suspect in self.inspect(job, now).await {
                report.suspects += 1;
                let key = format!("{}:{}", suspect.kind.as_str(), job.id);
                let seen = observations.observe(&key, now);
                let failing_since = suspect.failing_since.unwrap_or(seen.first_seen);

                if acted.contains(&job.id) {
                    continue;
                }
                if seen.cycles < 2 {
                    debug!(job_id = %job.id, signal = suspect.kind.as_str(), "first observation, waiting for confirmation");
                    report.deferred += 1;
                    continue;
                }
                if now - failing_since < Duration::seconds(self.settings.min_failure_secs) {
                    debug!(job_id = %job.id, signal = suspect.kind.as_str(), "failure too recent to act on");
                    report.deferred += 1;
                    continue;
                }
                if self.deploy_lock.is_held(now)? {
                    info!(job_id = %job.id, signal = suspect.kind.as_str(), "deploy lock held, not recovering");
                    report.deploy_locked = true;
                    continue;
                }
                // Budget is spent before the write
                if !limiter.try_spend(&job.id, now)? {
                    warn!(job_id = %job.id, signal = suspect.kind.as_str(), "recovery budget exhausted");
                    report.rate_limited += 1;
                    continue;
                }
                let detail = format!("soft recovery ({}): {}", suspect.kind.as_str(), suspect.detail);
                let moved = self
                    .store
                    .transition(
                        &job.id,
                        JobStatus::Running,
                        JobStatus::Retryable,
                        Actor::Recovery,
                        Changes {
                            last_error: Some(Some(detail.clone())),
                            ..Default::default()
                        },
                        Some(&detail),
                        now,
                    )
                    .await?;

                observations.clear(&key);
                acted.insert(job.id.clone());
                if moved {
                    warn!(job_id = %job.id, signal = suspect.kind.as_str(), "forced running job back to retryable");
                    report.recovered.push(job.id.clone());
                } else {
                    debug!(job_id = %job.id, "job left running before recovery");
                }
            }
        }

        observations.finish_cycle()?;
        Ok(report)
    }

    async fn inspect(&self, job: &Job, now: DateTime<Utc>) -> Vec<Suspect> {
        let mut suspects = Vec::new();

        if let Some(kind) = check_output_dir(&job.output_dir).await {
            suspects.push(Suspect {
                kind: SignalKind::Mount,
                failing_since: None,
                detail: format!("{} on {}", kind, job.output_dir.display()),
            });
        }

        // A retried job keeps the previous attempt's last_progress_at
        let reference = match (job.started_at, job.last_progress_at) {
            (Some(s), Some(p)) => Some(s.max(p)),
            (s, p) => s.or(p),
        };
        if let Some(reference) = reference {
            let idle = now - reference;
            if idle >= Duration::minutes(self.settings.stall_after_mins) {
                suspects.push(Suspect {
                    kind: SignalKind::Stall,
                    failing_since: Some(reference),
                    detail: format!(
                        "no progress for {} minutes ({} pages crawled)",
                        idle.num_minutes(),
                        job.progress.pages_crawled
                    ),
                });
            }
        }

        suspects
    }

    /// Run cycles until Ctrl-C, or once when `once` is set.
    pub async fn run(&self, once: bool) -> Result<()> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    let _ = stop_tx.send(true);
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            }
        });

        let interval = std::time::Duration::from_secs(self.settings.interval_secs);
        loop {
            match self.run_cycle(Utc::now()).await {
                Ok(report) => {
                    if once {
                        print_report(&report);
                        return Ok(());
                    }
                    if !report.recovered.is_empty() {
                        info!(recovered = report.recovered.len(), "recovery cycle finished");
                    }
                }
                Err(e) if once => return Err(e),
                Err(e) => error!(error = %e, "recovery cycle failed"),
            }

            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        Ok(())
    }
}

/// Check that `dir` is reachable. A check that hangs counts as a stale mount.
async fn check_output_dir(dir: &Path) -> Option<InfraErrorKind> {
    match tokio::time::timeout(MOUNT_CHECK_TIMEOUT, tokio::fs::read_dir(dir)).await {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => InfraErrorKind::classify(&e),
        Err(_) => Some(InfraErrorKind::StaleMount),
    }
}

fn print_report(report: &CycleReport) {
    println!("running jobs: {}", report.running);
    println!("suspects: {}", report.suspects);
    println!("deferred: {}", report.deferred);
    println!("rate limited: {}", report.rate_limited);
    if report.deploy_locked {
        println!("deploy lock held");
    }
    for id in &report.recovered {
        println!("recovered: {}", id);
    }
}

/// CLI entry point for `arh recover`.
pub async fn run_recovery(config: &Config, once: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let coordinator = RecoveryCoordinator::new(JobStore::new(pool.clone()), config.recovery.clone());
    let result = coordinator.run(once).await;
    pool.close().await;
    result
}
