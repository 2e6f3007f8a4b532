use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // Sources mirror the `[sources.*]` configuration
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            seeds_json TEXT NOT NULL,
            scope_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            source_code TEXT NOT NULL,
            name TEXT NOT NULL,
            output_dir TEXT NOT NULL,
            seeds_json TEXT NOT NULL,
            scope_json TEXT NOT NULL DEFAULT '{}',
            options_json TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'queued',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            campaign_order INTEGER,
            infra_error_cooldown_until INTEGER,
            exit_code INTEGER,
            last_error TEXT,
            pages_crawled INTEGER NOT NULL DEFAULT 0,
            pages_total INTEGER NOT NULL DEFAULT 0,
            pages_failed INTEGER NOT NULL DEFAULT 0,
            warc_count INTEGER NOT NULL DEFAULT 0,
            indexed_page_count INTEGER NOT NULL DEFAULT 0,
            queued_at INTEGER NOT NULL,
            started_at INTEGER,
            finished_at INTEGER,
            indexed_at INTEGER,
            last_progress_at INTEGER,
            FOREIGN KEY (source_code) REFERENCES sources(code)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            source_code TEXT NOT NULL,
            url TEXT NOT NULL,
            normalized_url_group TEXT NOT NULL,
            captured_at INTEGER NOT NULL,
            capture_time_inferred INTEGER NOT NULL DEFAULT 0,
            title TEXT NOT NULL DEFAULT '',
            snippet TEXT NOT NULL DEFAULT '',
            language TEXT NOT NULL DEFAULT '',
            content_hash TEXT NOT NULL,
            warc_file TEXT NOT NULL,
            warc_record_id TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            status_code INTEGER,
            UNIQUE(job_id, warc_record_id),
            FOREIGN KEY (job_id) REFERENCES jobs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Audit trail of every status transition
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            at INTEGER NOT NULL,
            actor TEXT NOT NULL,
            from_status TEXT,
            to_status TEXT NOT NULL,
            detail TEXT,
            FOREIGN KEY (job_id) REFERENCES jobs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_output_dir ON jobs(output_dir)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_pick ON jobs(status, campaign_order, queued_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_job_id ON snapshots(job_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_group ON snapshots(normalized_url_group, captured_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_events_job_id ON job_events(job_id, at)")
        .execute(pool)
        .await?;

    Ok(())
}
