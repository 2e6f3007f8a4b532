//! Indexing pipeline: discovery → reader → extractor → snapshots.
//!
//! Persistence is keyed on `(job_id, warc_record_id)`. Record ids already
//! stored for the job are skipped before extraction and every insert is
//! `ON CONFLICT DO NOTHING`, so the pipeline can be re-run from any point of
//! failure without creating duplicates or operator cleanup.
//!
//! File- and record-level problems are logged and skipped. Only an
//! unreadable output directory, an empty archive set for a job that crawled
//! pages, or a database failure fails the job.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, IndexingConfig};
use crate::db;
use crate::discovery;
use crate::error::IndexError;
use crate::extract;
use crate::jobs::{Changes, JobStore};
use crate::models::{Actor, ArchiveRecord, Job, JobStatus, Snapshot};
use crate::warc;

/// Aggregate counters for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSummary {
    /// Archive files discovered for the job.
    pub warc_count: i64,
    /// Snapshots stored for the job after this run.
    pub indexed_page_count: i64,
    pub inserted: u64,
    pub already_indexed: u64,
    pub record_errors: u64,
    pub files_failed: u64,
    pub used_fallback: bool,
}

/// Run the pipeline for one job. Touches only the `snapshots` table.
pub async fn index_job(
    pool: &SqlitePool,
    job: &Job,
    settings: &IndexingConfig,
) -> Result<IndexSummary, IndexError> {
    let found =
        discovery::discover(&job.output_dir).map_err(|source| IndexError::OutputUnreadable {
            path: job.output_dir.clone(),
            source,
        })?;

    if found.files.is_empty() && job.progress.pages_crawled > 0 {
        return Err(IndexError::NoArchives {
            job_id: job.id.clone(),
            pages_crawled: job.progress.pages_crawled,
        });
    }

    let mut seen = existing_record_ids(pool, &job.id).await?;
    let mut summary = IndexSummary {
        warc_count: found.files.len() as i64,
        used_fallback: found.used_fallback,
        ..Default::default()
    };
    let file_cap = Duration::from_secs(settings.max_file_secs);

    for path in &found.files {
        let warc_file = path
            .strip_prefix(&job.output_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        let reader = match warc::open(path, settings.html_only) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(job_id = %job.id, file = %warc_file, error = %e, "skipping unreadable archive file");
                summary.files_failed += 1;
                continue;
            }
        };

        let started = Instant::now();
        let mut file_failed = false;
        let mut tx = pool.begin().await?;

        for item in reader {
            if started.elapsed() > file_cap {
                warn!(job_id = %job.id, file = %warc_file, cap_secs = settings.max_file_secs, "archive file exceeded duration cap, moving on");
                file_failed = true;
                break;
            }

            let record = match item {
                Ok(record) => record,
                Err(e) => {
                    warn!(job_id = %job.id, file = %warc_file, error = %e, "archive read error");
                    summary.record_errors += 1;
                    file_failed = true;
                    continue;
                }
            };

            if !seen.insert(record.record_id.clone()) {
                summary.already_indexed += 1;
                continue;
            }

            let snapshot = build_snapshot(job, &warc_file, &record, settings.snippet_chars);
            if insert_snapshot(&mut tx, &snapshot).await? {
                summary.inserted += 1;
            } else {
                summary.already_indexed += 1;
            }
        }

        tx.commit().await?;
        if file_failed {
            summary.files_failed += 1;
        }
    }

    summary.indexed_page_count = count_snapshots(pool, &job.id).await?;

    info!(
        job_id = %job.id,
        warc_count = summary.warc_count,
        indexed_page_count = summary.indexed_page_count,
        inserted = summary.inserted,
        already_indexed = summary.already_indexed,
        record_errors = summary.record_errors,
        files_failed = summary.files_failed,
        "indexing finished"
    );

    Ok(summary)
}

/// Move a job through `indexing` to `indexed` or `index_failed`.
///
/// The orchestrator calls this with [`Actor::Indexer`] right after a
/// successful capture; the `index` command calls it with
/// [`Actor::Operator`] to re-index a `completed` or `index_failed` job.
pub async fn index_and_record(
    store: &JobStore,
    job: &Job,
    settings: &IndexingConfig,
    actor: Actor,
) -> Result<(JobStatus, Option<IndexSummary>)> {
    let claimed = store
        .transition(
            &job.id,
            job.status,
            JobStatus::Indexing,
            actor,
            Changes::default(),
            None,
            Utc::now(),
        )
        .await?;
    if !claimed {
        bail!(
            "job {} is no longer '{}'; not indexing",
            job.id,
            job.status
        );
    }

    match index_job(store.pool(), job, settings).await {
        Ok(summary) => {
            store
                .transition(
                    &job.id,
                    JobStatus::Indexing,
                    JobStatus::Indexed,
                    actor,
                    Changes {
                        warc_count: Some(summary.warc_count),
                        indexed_page_count: Some(summary.indexed_page_count),
                        indexed_at: Some(Utc::now()),
                        last_error: Some(None),
                        ..Default::default()
                    },
                    Some(&format!(
                        "{} snapshots from {} archive files",
                        summary.indexed_page_count, summary.warc_count
                    )),
                    Utc::now(),
                )
                .await?;
            Ok((JobStatus::Indexed, Some(summary)))
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "indexing failed");
            let detail = e.to_string();
            store
                .transition(
                    &job.id,
                    JobStatus::Indexing,
                    JobStatus::IndexFailed,
                    actor,
                    Changes {
                        last_error: Some(Some(detail.clone())),
                        ..Default::default()
                    },
                    Some(&detail),
                    Utc::now(),
                )
                .await?;
            Ok((JobStatus::IndexFailed, None))
        }
    }
}

fn build_snapshot(job: &Job, warc_file: &str, record: &ArchiveRecord, snippet_chars: usize) -> Snapshot {
    let extraction = extract::extract(record, snippet_chars);
    let (captured_at, capture_time_inferred) = match record.warc_date.as_deref().and_then(parse_warc_date) {
        Some(ts) => (ts, false),
        None => {
            warn!(
                job_id = %job.id,
                record_id = %record.record_id,
                warc_date = record.warc_date.as_deref().unwrap_or(""),
                "unparseable WARC-Date, using indexing time as capture time"
            );
            (Utc::now(), true)
        }
    };

    Snapshot {
        id: Uuid::new_v4().to_string(),
        job_id: job.id.clone(),
        source_code: job.source_code.clone(),
        url: record.target_uri.clone(),
        normalized_url_group: extraction.normalized_url_group,
        captured_at,
        capture_time_inferred,
        title: extraction.title,
        snippet: extraction.snippet,
        language: extraction.language,
        content_hash: extraction.content_hash,
        warc_file: warc_file.to_string(),
        warc_record_id: record.record_id.clone(),
        mime_type: record.mime_type(),
        status_code: record.http_status.map(i64::from),
    }
}

/// RFC 3339 (`WARC/1.x`) or 14-digit (`ARC`-style) timestamps.
pub fn parse_warc_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

async fn insert_snapshot(
    tx: &mut Transaction<'_, Sqlite>,
    snapshot: &Snapshot,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO snapshots (id, job_id, source_code, url, normalized_url_group, captured_at,
                               capture_time_inferred, title, snippet, language, content_hash,
                               warc_file, warc_record_id, mime_type, status_code)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(job_id, warc_record_id) DO NOTHING
        "#,
    )
    .bind(&snapshot.id)
    .bind(&snapshot.job_id)
    .bind(&snapshot.source_code)
    .bind(&snapshot.url)
    .bind(&snapshot.normalized_url_group)
    .bind(snapshot.captured_at.timestamp())
    .bind(snapshot.capture_time_inferred)
    .bind(&snapshot.title)
    .bind(&snapshot.snippet)
    .bind(&snapshot.language)
    .bind(&snapshot.content_hash)
    .bind(&snapshot.warc_file)
    .bind(&snapshot.warc_record_id)
    .bind(&snapshot.mime_type)
    .bind(snapshot.status_code)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn existing_record_ids(pool: &SqlitePool, job_id: &str) -> Result<HashSet<String>, sqlx::Error> {
    let ids: Vec<String> = sqlx::query_scalar("SELECT warc_record_id FROM snapshots WHERE job_id = ?")
        .bind(job_id)
        .fetch_all(pool)
        .await?;
    Ok(ids.into_iter().collect())
}

pub async fn count_snapshots(pool: &SqlitePool, job_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM snapshots WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await
}

pub async fn list_snapshots(pool: &SqlitePool, job_id: &str) -> Result<Vec<Snapshot>> {
    let rows = sqlx::query(
        r#"
        SELECT id, job_id, source_code, url, normalized_url_group, captured_at, capture_time_inferred,
               title, snippet, language, content_hash, warc_file, warc_record_id, mime_type, status_code
        FROM snapshots WHERE job_id = ? ORDER BY warc_file ASC, rowid ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Snapshot {
            id: row.get("id"),
            job_id: row.get("job_id"),
            source_code: row.get("source_code"),
            url: row.get("url"),
            normalized_url_group: row.get("normalized_url_group"),
            captured_at: DateTime::from_timestamp(row.get("captured_at"), 0).unwrap_or_default(),
            capture_time_inferred: row.get("capture_time_inferred"),
            title: row.get("title"),
            snippet: row.get("snippet"),
            language: row.get("language"),
            content_hash: row.get("content_hash"),
            warc_file: row.get("warc_file"),
            warc_record_id: row.get("warc_record_id"),
            mime_type: row.get("mime_type"),
            status_code: row.get("status_code"),
        })
        .collect())
}

/// CLI entry point for the explicit re-index maintenance command.
pub async fn run_index(config: &Config, job_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = JobStore::new(pool.clone());

    let Some(job) = store.get_job(job_id).await? else {
        bail!("job not found: {}", job_id);
    };
    if !matches!(job.status, JobStatus::Completed | JobStatus::IndexFailed) {
        bail!(
            "job {} is '{}'; only completed or index_failed jobs can be indexed",
            job.id,
            job.status
        );
    }

    let (status, summary) = index_and_record(&store, &job, &config.indexing, Actor::Operator).await?;

    println!("index {}", job.id);
    if let Some(summary) = summary {
        println!("  archive files: {}", summary.warc_count);
        println!("  inserted snapshots: {}", summary.inserted);
        println!("  already indexed: {}", summary.already_indexed);
        println!("  record errors: {}", summary.record_errors);
        println!("  files with errors: {}", summary.files_failed);
        println!("  indexed pages: {}", summary.indexed_page_count);
    }
    println!("  status: {}", status);

    pool.close().await;
    Ok(())
}
