//! Job Store: the durable record of job identity, configuration, status and
//! progress counters.
//!
//! All status changes go through [`JobStore::transition`], a single
//! conditional `UPDATE ... WHERE id = ? AND status = ?`. A zero row count means
//! another process moved the job first; callers treat that as "abandon" and
//! never retry against a stale read. Each successful transition appends a row
//! to `job_events` in the same transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Actor, CrawlProgress, Job, JobStatus, NewJob};
use crate::state;

const JOB_COLUMNS: &str = "id, source_code, name, output_dir, seeds_json, scope_json, options_json, \
    status, retry_count, max_retries, campaign_order, infra_error_cooldown_until, exit_code, \
    last_error, pages_crawled, pages_total, pages_failed, warc_count, indexed_page_count, \
    queued_at, started_at, finished_at, indexed_at, last_progress_at";

/// Column updates applied together with a status change.
///
/// `Option<Option<_>>` fields distinguish "leave alone" (`None`) from
/// "set to NULL" (`Some(None)`).
#[derive(Debug, Default, Clone)]
pub struct Changes {
    pub increment_retry: bool,
    pub cooldown_until: Option<Option<DateTime<Utc>>>,
    pub exit_code: Option<Option<i64>>,
    pub last_error: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub indexed_at: Option<DateTime<Utc>>,
    pub progress: Option<CrawlProgress>,
    pub warc_count: Option<i64>,
    pub indexed_page_count: Option<i64>,
}

/// One row of the audit trail.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_job(&self, new: &NewJob, now: DateTime<Utc>) -> Result<Job> {
        let id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, source_code, name, output_dir, seeds_json, scope_json, options_json,
                              status, max_retries, campaign_order, queued_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'queued', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.source_code)
        .bind(&new.name)
        .bind(new.output_dir.to_string_lossy().to_string())
        .bind(serde_json::to_string(&new.seeds)?)
        .bind(serde_json::to_string(&new.scope)?)
        .bind(serde_json::to_string(&new.options)?)
        .bind(new.max_retries as i64)
        .bind(new.campaign_order)
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to create job for source '{}'", new.source_code))?;

        insert_event(&mut tx, &id, now, Actor::Operator, None, JobStatus::Queued, None).await?;
        tx.commit().await?;

        info!(job_id = %id, source = %new.source_code, name = %new.name, "job queued");

        self.get_job(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {} vanished after insert", id))
    }

    /// The job that owns `output_dir`, if any.
    pub async fn job_for_output_dir(&self, output_dir: &Path) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE output_dir = ?", JOB_COLUMNS))
            .bind(output_dir.to_string_lossy().to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM jobs WHERE status = ? ORDER BY queued_at ASC, rowid ASC",
                    JOB_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM jobs ORDER BY queued_at ASC, rowid ASC",
                    JOB_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(job_from_row).collect()
    }

    /// Jobs eligible for a pick at `now`, in pick order: explicit campaign
    /// order first, then FIFO by `queued_at`.
    pub async fn pick_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM jobs
            WHERE status IN ('queued', 'retryable')
              AND (infra_error_cooldown_until IS NULL OR infra_error_cooldown_until <= ?)
            ORDER BY campaign_order IS NULL, campaign_order ASC, queued_at ASC, rowid ASC
            LIMIT ?
            "#,
            JOB_COLUMNS
        ))
        .bind(now.timestamp())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn count_in_status(&self, status: JobStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Compare-and-set a job from `from` to `to`.
    ///
    /// Returns `Ok(false)` when the stored status no longer equals `from`, or
    /// when moving to `running` while another job is running against the same
    /// output directory; nothing is written in that case. Illegal edges are rejected before the
    /// database is touched.
    #[allow(clippy::too_many_arguments)]
    pub async fn transition(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        actor: Actor,
        changes: Changes,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        state::check(from, to, actor)?;

        let mut tx = self.pool.begin().await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE jobs SET status = ");
        qb.push_bind(to.as_str());
        if changes.increment_retry {
            qb.push(", retry_count = retry_count + 1");
        }
        if let Some(until) = changes.cooldown_until {
            qb.push(", infra_error_cooldown_until = ")
                .push_bind(until.map(|t| t.timestamp()));
        }
        if let Some(code) = changes.exit_code {
            qb.push(", exit_code = ").push_bind(code);
        }
        if let Some(err) = changes.last_error {
            qb.push(", last_error = ").push_bind(err);
        }
        if let Some(t) = changes.started_at {
            qb.push(", started_at = ").push_bind(t.timestamp());
        }
        if let Some(t) = changes.finished_at {
            qb.push(", finished_at = ").push_bind(t.timestamp());
        }
        if let Some(t) = changes.indexed_at {
            qb.push(", indexed_at = ").push_bind(t.timestamp());
        }
        if let Some(p) = changes.progress {
            qb.push(", pages_crawled = ")
                .push_bind(p.pages_crawled)
                .push(", pages_total = ")
                .push_bind(p.pages_total)
                .push(", pages_failed = ")
                .push_bind(p.pages_failed);
        }
        if let Some(n) = changes.warc_count {
            qb.push(", warc_count = ").push_bind(n);
        }
        if let Some(n) = changes.indexed_page_count {
            qb.push(", indexed_page_count = ").push_bind(n);
        }
        qb.push(" WHERE id = ")
            .push_bind(id)
            .push(" AND status = ")
            .push_bind(from.as_str());
        if to == JobStatus::Running {
            // One writer per output directory
            qb.push(
                " AND NOT EXISTS (SELECT 1 FROM jobs AS other \
                 WHERE other.output_dir = jobs.output_dir \
                 AND other.status = 'running' AND other.id != jobs.id)",
            );
        }

        let affected = qb.build().execute(&mut *tx).await?.rows_affected();
        if affected == 0 {
            tx.rollback().await?;
            debug!(job_id = %id, from = %from, to = %to, actor = %actor, "transition lost: status changed underneath");
            return Ok(false);
        }

        insert_event(&mut tx, id, now, actor, Some(from), to, detail).await?;
        tx.commit().await?;

        info!(job_id = %id, from = %from, to = %to, actor = %actor, detail = detail.unwrap_or(""), "job transition");
        Ok(true)
    }

    /// Persist crawl counters for a running job. `last_progress_at` only moves
    /// when `pages_crawled` increases. Best-effort: never used for scheduling.
    pub async fn record_progress(
        &self,
        id: &str,
        progress: CrawlProgress,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs SET
                last_progress_at = CASE WHEN ? > pages_crawled THEN ? ELSE last_progress_at END,
                pages_crawled = ?,
                pages_total = ?,
                pages_failed = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(progress.pages_crawled)
        .bind(now.timestamp())
        .bind(progress.pages_crawled)
        .bind(progress.pages_total)
        .bind(progress.pages_failed)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    pub async fn events(&self, id: &str) -> Result<Vec<JobEvent>> {
        let rows = sqlx::query(
            "SELECT at, actor, from_status, to_status, detail FROM job_events WHERE job_id = ? ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| JobEvent {
                at: from_ts(row.get("at")),
                actor: row.get("actor"),
                from_status: row.get("from_status"),
                to_status: row.get("to_status"),
                detail: row.get("detail"),
            })
            .collect())
    }
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    job_id: &str,
    at: DateTime<Utc>,
    actor: Actor,
    from: Option<JobStatus>,
    to: JobStatus,
    detail: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO job_events (job_id, at, actor, from_status, to_status, detail) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(job_id)
    .bind(at.timestamp())
    .bind(actor.as_str())
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(detail)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let status: String = row.get("status");
    let output_dir: String = row.get("output_dir");
    let seeds_json: String = row.get("seeds_json");
    let scope_json: String = row.get("scope_json");
    let options_json: String = row.get("options_json");

    Ok(Job {
        id: row.get("id"),
        source_code: row.get("source_code"),
        name: row.get("name"),
        output_dir: PathBuf::from(output_dir),
        seeds: serde_json::from_str(&seeds_json).context("Invalid seeds_json on job row")?,
        scope: serde_json::from_str(&scope_json).context("Invalid scope_json on job row")?,
        options: serde_json::from_str(&options_json).context("Invalid options_json on job row")?,
        status: status.parse()?,
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        campaign_order: row.get("campaign_order"),
        infra_error_cooldown_until: opt_ts(row.get("infra_error_cooldown_until")),
        exit_code: row.get("exit_code"),
        last_error: row.get("last_error"),
        progress: CrawlProgress {
            pages_crawled: row.get("pages_crawled"),
            pages_total: row.get("pages_total"),
            pages_failed: row.get("pages_failed"),
        },
        warc_count: row.get("warc_count"),
        indexed_page_count: row.get("indexed_page_count"),
        queued_at: from_ts(row.get("queued_at")),
        started_at: opt_ts(row.get("started_at")),
        finished_at: opt_ts(row.get("finished_at")),
        indexed_at: opt_ts(row.get("indexed_at")),
        last_progress_at: opt_ts(row.get("last_progress_at")),
    })
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn opt_ts(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.map(from_ts)
}
