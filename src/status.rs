//! Operator-facing job commands: `job add`, `job list`, `job show`.
//!
//! Terminal jobs stay visible here with their counters and last error; the
//! harness never deletes a job.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::db;
use crate::jobs::JobStore;
use crate::models::{CaptureOptions, Job, JobStatus, NewJob};
use crate::pipeline;
use crate::sources;

const RECENT_EVENTS: usize = 20;

/// Queue a new capture job for a configured source.
pub async fn create_job_for_source(
    config: &Config,
    store: &JobStore,
    source_code: &str,
    name: Option<&str>,
    campaign_order: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Job> {
    let Some(source) = sources::configured_sources(config)
        .into_iter()
        .find(|s| s.code == source_code)
    else {
        bail!("unknown source '{}'; see `arh sources`", source_code);
    };
    sources::upsert_source(store.pool(), &source).await?;

    let source_root = config.worker.output_root.join(&source.code);
    let name = match name {
        Some(name) => {
            if let Some(existing) = store.job_for_output_dir(&source_root.join(name)).await? {
                bail!(
                    "job name '{}' is already used by job {} for source '{}'",
                    name,
                    existing.id,
                    source.code
                );
            }
            name.to_string()
        }
        None => {
            let base = format!("{}-{}", source.code, now.format("%Y%m%dT%H%M%S"));
            let mut name = base.clone();
            let mut n = 2;
            while store.job_for_output_dir(&source_root.join(&name)).await?.is_some() {
                name = format!("{}-{}", base, n);
                n += 1;
            }
            name
        }
    };
    let output_dir = source_root.join(&name);

    let new = NewJob {
        source_code: source.code.clone(),
        name,
        output_dir,
        seeds: source.seeds.clone(),
        scope: source.scope.clone(),
        options: CaptureOptions {
            workers: config.capture.workers,
            stall_timeout_mins: config.capture.stall_timeout_mins,
            restart_budget: config.capture.restart_budget,
        },
        max_retries: config.worker.max_retries,
        campaign_order,
    };
    store.create_job(&new, now).await
}

pub async fn run_job_add(
    config: &Config,
    source_code: &str,
    name: Option<&str>,
    campaign_order: Option<i64>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = JobStore::new(pool.clone());

    let job = create_job_for_source(config, &store, source_code, name, campaign_order, Utc::now()).await?;
    println!("queued {}", job.id);
    println!("  name: {}", job.name);
    println!("  output: {}", job.output_dir.display());

    pool.close().await;
    Ok(())
}

pub async fn run_job_list(config: &Config, status: Option<JobStatus>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = JobStore::new(pool.clone());
    let jobs = store.list_jobs(status).await?;

    if jobs.is_empty() {
        println!("No jobs.");
        pool.close().await;
        return Ok(());
    }

    println!(
        "{:<36}  {:<12} {:<12} {:>7} {:>9} {:>6} {:>8}",
        "ID", "SOURCE", "STATUS", "RETRIES", "CRAWLED", "WARCS", "INDEXED"
    );
    for job in &jobs {
        println!(
            "{:<36}  {:<12} {:<12} {:>7} {:>9} {:>6} {:>8}",
            job.id,
            job.source_code,
            job.status.as_str(),
            format!("{}/{}", job.retry_count, job.max_retries),
            job.progress.pages_crawled,
            job.warc_count,
            job.indexed_page_count
        );
    }

    pool.close().await;
    Ok(())
}

pub async fn run_job_show(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = JobStore::new(pool.clone());

    let Some(job) = store.get_job(id).await? else {
        bail!("job not found: {}", id);
    };
    let snapshots = pipeline::count_snapshots(&pool, &job.id).await?;
    let events = store.events(&job.id).await?;

    println!("Job {}", job.id);
    match sources::get_source(&pool, &job.source_code).await? {
        Some(source) => println!("  source:       {} ({})", job.source_code, source.name),
        None => println!("  source:       {}", job.source_code),
    }
    println!("  name:         {}", job.name);
    println!("  status:       {}", job.status);
    println!("  output:       {}", job.output_dir.display());
    println!("  retries:      {}/{}", job.retry_count, job.max_retries);
    if let Some(order) = job.campaign_order {
        println!("  campaign:     {}", order);
    }
    if let Some(until) = job.infra_error_cooldown_until {
        println!("  cooldown:     until {}", fmt_ts(until));
    }
    println!(
        "  crawled:      {} / {} ({} failed)",
        job.progress.pages_crawled, job.progress.pages_total, job.progress.pages_failed
    );
    println!("  archives:     {}", job.warc_count);
    println!("  indexed:      {} ({} snapshots stored)", job.indexed_page_count, snapshots);
    println!("  queued:       {}", fmt_ts(job.queued_at));
    println!("  started:      {}", fmt_opt(job.started_at));
    println!("  finished:     {}", fmt_opt(job.finished_at));
    println!("  indexed at:   {}", fmt_opt(job.indexed_at));
    println!("  progress at:  {}", fmt_opt(job.last_progress_at));
    if let Some(code) = job.exit_code {
        println!("  exit code:    {}", code);
    }
    if let Some(err) = &job.last_error {
        println!("  last error:   {}", err);
    }

    if !events.is_empty() {
        println!();
        println!("  Recent events:");
        let skip = events.len().saturating_sub(RECENT_EVENTS);
        for event in events.iter().skip(skip) {
            println!(
                "  {}  {:<12} {:>12} -> {:<12} {}",
                fmt_ts(event.at),
                event.actor,
                event.from_status.as_deref().unwrap_or("-"),
                event.to_status,
                event.detail.as_deref().unwrap_or("")
            );
        }
    }

    pool.close().await;
    Ok(())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn fmt_opt(ts: Option<DateTime<Utc>>) -> String {
    ts.map(fmt_ts).unwrap_or_else(|| "-".to_string())
}
