mod common;

use archive_harness::coordination::DeployLock;
use archive_harness::error::InfraErrorKind;
use archive_harness::jobs::{Changes, JobStore};
use archive_harness::models::{Actor, CrawlProgress, Job, JobStatus};
use archive_harness::orchestrator::{Orchestrator, PollOutcome, SkipReason};
use archive_harness::status::create_job_for_source;
use archive_harness::supervisor::{CaptureDisposition, CaptureSupervisor};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::*;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

enum Step {
    Fail(i64),
    StaleMount,
    Succeed { files: usize, html: usize, other: usize },
    /// A recovery coordinator resets the job while the capture is running.
    ResetThenFail,
    /// Same, but the supervisor notices and stops the tool.
    ResetThenRelease,
}

#[derive(Clone, Default)]
struct Scripted {
    steps: Arc<Mutex<VecDeque<Step>>>,
    runs: Arc<Mutex<Vec<String>>>,
}

impl Scripted {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            runs: Arc::default(),
        }
    }

    fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl CaptureSupervisor for Scripted {
    async fn run(&self, job: &Job, store: &JobStore) -> CaptureDisposition {
        self.runs.lock().unwrap().push(job.name.clone());
        let step = self.steps.lock().unwrap().pop_front().expect("unscripted capture");
        match step {
            Step::Fail(code) => CaptureDisposition::CaptureFailure {
                exit_code: Some(code),
                detail: format!("capture exited with exit status: {}", code),
            },
            Step::StaleMount => CaptureDisposition::InfrastructureFailure {
                kind: InfraErrorKind::StaleMount,
                detail: format!("{}: Stale file handle (os error 116)", job.output_dir.display()),
            },
            Step::Succeed { files, html, other } => {
                std::fs::create_dir_all(&job.output_dir).unwrap();
                populate_archive(&job.output_dir, files, html, other);
                CaptureDisposition::Success {
                    progress: Some(CrawlProgress {
                        pages_crawled: (files * (html + other)) as i64,
                        pages_total: (files * (html + other)) as i64,
                        pages_failed: 0,
                    }),
                }
            }
            Step::ResetThenRelease => {
                assert!(store
                    .transition(
                        &job.id,
                        JobStatus::Running,
                        JobStatus::Retryable,
                        Actor::Recovery,
                        Changes::default(),
                        Some("soft recovery (stall)"),
                        Utc::now(),
                    )
                    .await
                    .unwrap());
                CaptureDisposition::Released {
                    status: JobStatus::Retryable,
                }
            }
            Step::ResetThenFail => {
                assert!(store
                    .transition(
                        &job.id,
                        JobStatus::Running,
                        JobStatus::Retryable,
                        Actor::Recovery,
                        Changes::default(),
                        Some("soft recovery (stall)"),
                        Utc::now(),
                    )
                    .await
                    .unwrap());
                CaptureDisposition::CaptureFailure {
                    exit_code: Some(137),
                    detail: "killed".into(),
                }
            }
        }
    }
}

fn orchestrator(h: &Harness, fake: &Scripted) -> Orchestrator {
    Orchestrator::from_config(&h.config, h.store.clone(), Box::new(fake.clone()))
}

async fn queue(h: &Harness, name: &str, campaign: Option<i64>) -> Job {
    create_job_for_source(&h.config, &h.store, "hc", Some(name), campaign, Utc::now())
        .await
        .unwrap()
}

#[tokio::test]
async fn three_capture_failures_exhaust_retries() {
    let h = Harness::new().await;
    let fake = Scripted::new(vec![Step::Fail(1), Step::Fail(1), Step::Fail(1)]);
    let orch = orchestrator(&h, &fake);
    let job = queue(&h, "hc-b", None).await;

    let mut seen = Vec::new();
    for _ in 0..3 {
        match orch.poll_at(Utc::now()).await.unwrap() {
            PollOutcome::Ran { job_id, status } => {
                assert_eq!(job_id, job.id);
                seen.push(status);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(
        seen,
        vec![JobStatus::Retryable, JobStatus::Retryable, JobStatus::Failed]
    );

    let job = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);
    assert_eq!(job.exit_code, Some(1));
    assert!(job.last_error.unwrap().contains("exit status: 1"));

    // Terminal: never picked again
    assert_eq!(orch.poll_at(Utc::now()).await.unwrap(), PollOutcome::Idle);
    assert_eq!(fake.runs().len(), 3);
}

#[tokio::test]
async fn infrastructure_failure_cools_down_without_spending_retries() {
    let h = Harness::new().await;
    let fake = Scripted::new(vec![
        Step::StaleMount,
        Step::Succeed {
            files: 1,
            html: 3,
            other: 0,
        },
    ]);
    let orch = orchestrator(&h, &fake);
    let job = queue(&h, "hc-c", None).await;

    let failed_at = Utc::now();
    let outcome = orch.poll_at(failed_at).await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Ran {
            job_id: job.id.clone(),
            status: JobStatus::Retryable
        }
    );

    let stored = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Retryable);
    assert_eq!(stored.retry_count, 0);
    let until = stored.infra_error_cooldown_until.unwrap();
    let ahead = (until - failed_at).num_seconds();
    assert!((595..=605).contains(&ahead), "cooldown {}s ahead", ahead);
    assert!(stored.last_error.unwrap().starts_with("stale_mount"));

    // A minute later the job is still cooling down, cycle after cycle
    for offset in [1, 2, 5, 9] {
        let outcome = orch.poll_at(Utc::now() + Duration::minutes(offset)).await.unwrap();
        assert_eq!(outcome, PollOutcome::Idle);
    }
    assert_eq!(fake.runs().len(), 1);

    let outcome = orch.poll_at(Utc::now() + Duration::minutes(11)).await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Ran {
            job_id: job.id.clone(),
            status: JobStatus::Indexed
        }
    );
    let stored = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.infra_error_cooldown_until, None);
}

#[tokio::test]
async fn successful_capture_is_indexed_in_the_same_cycle() {
    let h = Harness::new().await;
    let fake = Scripted::new(vec![Step::Succeed {
        files: 3,
        html: 10,
        other: 2,
    }]);
    let orch = orchestrator(&h, &fake);
    let job = queue(&h, "hc-a", None).await;

    let outcome = orch.poll_at(Utc::now()).await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Ran {
            job_id: job.id.clone(),
            status: JobStatus::Indexed
        }
    );

    let stored = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.exit_code, Some(0));
    assert_eq!(stored.progress.pages_crawled, 36);
    assert_eq!(stored.warc_count, 3);
    assert_eq!(stored.indexed_page_count, 30);
    assert!(stored.started_at.is_some());
    assert!(stored.finished_at.is_some());

    let trail: Vec<(String, String)> = h
        .store
        .events(&job.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.actor, e.to_status))
        .collect();
    let expected = [
        ("operator", "queued"),
        ("orchestrator", "running"),
        ("orchestrator", "completed"),
        ("indexer", "indexing"),
        ("indexer", "indexed"),
    ];
    assert_eq!(
        trail,
        expected
            .iter()
            .map(|(a, s)| (a.to_string(), s.to_string()))
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn campaign_order_then_fifo() {
    let h = Harness::new().await;
    let empty = || Step::Succeed {
        files: 0,
        html: 0,
        other: 0,
    };
    let fake = Scripted::new(vec![empty(), empty(), empty()]);
    let orch = orchestrator(&h, &fake);

    queue(&h, "plain", None).await;
    queue(&h, "second", Some(2)).await;
    queue(&h, "first", Some(1)).await;

    for _ in 0..3 {
        orch.poll_at(Utc::now()).await.unwrap();
    }
    assert_eq!(fake.runs(), vec!["first", "second", "plain"]);
}

#[tokio::test]
async fn deploy_lock_skips_the_cycle() {
    let h = Harness::new().await;
    let fake = Scripted::new(vec![]);
    let orch = orchestrator(&h, &fake);
    let job = queue(&h, "hc-lock", None).await;

    let lock = DeployLock::new(
        h.config.recovery.deploy_lock(),
        h.config.recovery.deploy_lock_max_age_secs,
    );
    lock.acquire(Utc::now()).unwrap();

    let outcome = orch.poll_at(Utc::now()).await.unwrap();
    assert_eq!(outcome, PollOutcome::Skipped(SkipReason::DeployLocked));
    let stored = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
    assert!(fake.runs().is_empty());
}

#[tokio::test]
async fn running_ceiling_skips_the_cycle() {
    let h = Harness::new().await;
    let fake = Scripted::new(vec![]);
    let orch = orchestrator(&h, &fake);
    let busy = queue(&h, "busy", None).await;
    let waiting = queue(&h, "waiting", None).await;

    assert!(h
        .store
        .transition(
            &busy.id,
            JobStatus::Queued,
            JobStatus::Running,
            Actor::Orchestrator,
            Changes::default(),
            None,
            Utc::now()
        )
        .await
        .unwrap());

    let outcome = orch.poll_at(Utc::now()).await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Skipped(SkipReason::AtCapacity {
            running: 1,
            limit: 1
        })
    );
    let stored = h.store.get_job(&waiting.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Queued);
}

#[tokio::test]
async fn outcome_is_discarded_when_job_was_reset_during_capture() {
    let h = Harness::new().await;
    let fake = Scripted::new(vec![Step::ResetThenFail]);
    let orch = orchestrator(&h, &fake);
    let job = queue(&h, "hc-race", None).await;

    let outcome = orch.poll_at(Utc::now()).await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Ran {
            job_id: job.id.clone(),
            status: JobStatus::Retryable
        }
    );

    let stored = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Retryable);
    assert_eq!(stored.retry_count, 0);
    let actors: Vec<String> = h
        .store
        .events(&job.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.actor)
        .collect();
    assert_eq!(actors.last().map(String::as_str), Some("recovery"));
}

#[tokio::test]
async fn released_capture_leaves_the_reset_in_place() {
    let h = Harness::new().await;
    let fake = Scripted::new(vec![Step::ResetThenRelease]);
    let orch = orchestrator(&h, &fake);
    let job = queue(&h, "hc-released", None).await;

    let outcome = orch.poll_at(Utc::now()).await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Ran {
            job_id: job.id.clone(),
            status: JobStatus::Retryable
        }
    );
    let stored = h.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.exit_code, None);
}

#[tokio::test]
async fn default_names_never_share_an_output_dir() {
    let h = Harness::new().await;
    let now = Utc::now();
    let first = create_job_for_source(&h.config, &h.store, "hc", None, None, now)
        .await
        .unwrap();
    let second = create_job_for_source(&h.config, &h.store, "hc", None, None, now)
        .await
        .unwrap();
    assert_ne!(first.output_dir, second.output_dir);
    assert_eq!(second.name, format!("{}-2", first.name));

    let err = create_job_for_source(&h.config, &h.store, "hc", Some(&first.name), None, now)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already used"));
}

#[tokio::test]
async fn claim_refuses_a_second_writer_on_the_same_output_dir() {
    let h = Harness::new().await;
    let a = queue(&h, "shared-a", None).await;
    let b = queue(&h, "shared-b", None).await;

    // A database created before the unique index may hold duplicates
    sqlx::query("DROP INDEX idx_jobs_output_dir")
        .execute(h.store.pool())
        .await
        .unwrap();
    sqlx::query("UPDATE jobs SET output_dir = ? WHERE id = ?")
        .bind(a.output_dir.to_string_lossy().to_string())
        .bind(&b.id)
        .execute(h.store.pool())
        .await
        .unwrap();

    let claim = |id: String| {
        let store = h.store.clone();
        async move {
            store
                .transition(
                    &id,
                    JobStatus::Queued,
                    JobStatus::Running,
                    Actor::Orchestrator,
                    Changes::default(),
                    None,
                    Utc::now(),
                )
                .await
                .unwrap()
        }
    };
    assert!(claim(a.id.clone()).await);
    assert!(!claim(b.id.clone()).await);
    assert_eq!(
        h.store.get_job(&b.id).await.unwrap().unwrap().status,
        JobStatus::Queued
    );

    assert!(h
        .store
        .transition(
            &a.id,
            JobStatus::Running,
            JobStatus::Retryable,
            Actor::Orchestrator,
            Changes::default(),
            None,
            Utc::now()
        )
        .await
        .unwrap());
    assert!(claim(b.id.clone()).await);
}
