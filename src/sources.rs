//! Source registry.
//!
//! Sources are owned by configuration (`[sources.<code>]`). Syncing writes
//! them into the `sources` table so jobs can reference them; only seeds and
//! scope rules change on a re-sync.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::{ScopeRules, Source};

pub fn configured_sources(config: &Config) -> Vec<Source> {
    config
        .sources
        .iter()
        .map(|(code, cfg)| Source {
            code: code.clone(),
            name: cfg.name.clone(),
            seeds: cfg.seeds.clone(),
            scope: ScopeRules {
                allowed_hosts: cfg.allowed_hosts.clone(),
                path_prefixes: cfg.path_prefixes.clone(),
            },
        })
        .collect()
}

pub async fn upsert_source(pool: &SqlitePool, source: &Source) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sources (code, name, seeds_json, scope_json, updated_at) VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(code) DO UPDATE SET
            seeds_json = excluded.seeds_json,
            scope_json = excluded.scope_json,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&source.code)
    .bind(&source.name)
    .bind(serde_json::to_string(&source.seeds)?)
    .bind(serde_json::to_string(&source.scope)?)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await
    .with_context(|| format!("Failed to store source '{}'", source.code))?;
    Ok(())
}

pub async fn sync_sources(pool: &SqlitePool, config: &Config) -> Result<usize> {
    let sources = configured_sources(config);
    for source in &sources {
        upsert_source(pool, source).await?;
    }
    Ok(sources.len())
}

pub async fn get_source(pool: &SqlitePool, code: &str) -> Result<Option<Source>> {
    let row = sqlx::query("SELECT code, name, seeds_json, scope_json FROM sources WHERE code = ?")
        .bind(code)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let seeds_json: String = row.get("seeds_json");
    let scope_json: String = row.get("scope_json");
    Ok(Some(Source {
        code: row.get("code"),
        name: row.get("name"),
        seeds: serde_json::from_str(&seeds_json)?,
        scope: serde_json::from_str(&scope_json)?,
    }))
}

/// CLI entry point: sync configured sources and print them.
pub async fn list_sources(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let synced = sync_sources(&pool, config).await?;

    println!("{:<16} {:<32} {:>6}  HOSTS", "SOURCE", "NAME", "SEEDS");
    for source in configured_sources(config) {
        let hosts = if source.scope.allowed_hosts.is_empty() {
            "(seed hosts)".to_string()
        } else {
            source.scope.allowed_hosts.join(",")
        };
        println!(
            "{:<16} {:<32} {:>6}  {}",
            source.code,
            source.name,
            source.seeds.len(),
            hosts
        );
    }
    println!("synced: {}", synced);

    pool.close().await;
    Ok(())
}
