//! Core data models used throughout Archive Harness.
//!
//! These types represent the sources, capture jobs, archive records, and
//! snapshots that flow between the orchestrator and the indexing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle status of a capture job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Retryable,
    Failed,
    Indexing,
    Indexed,
    IndexFailed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Retryable,
        JobStatus::Failed,
        JobStatus::Indexing,
        JobStatus::Indexed,
        JobStatus::IndexFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Retryable => "retryable",
            JobStatus::Failed => "failed",
            JobStatus::Indexing => "indexing",
            JobStatus::Indexed => "indexed",
            JobStatus::IndexFailed => "index_failed",
        }
    }

    /// Statuses the orchestrator may pick a job from.
    pub fn is_pickable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Retryable)
    }

    /// No automatic transition leaves these statuses.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Indexed | JobStatus::IndexFailed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown job status: '{}'", s))
    }
}

/// Who caused a status transition. Stored on every audit event so automated
/// resets are never confused with a job failing on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Orchestrator,
    Indexer,
    Recovery,
    Operator,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Orchestrator => "orchestrator",
            Actor::Indexer => "indexer",
            Actor::Recovery => "recovery",
            Actor::Operator => "operator",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crawl-scope rules for a source or job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRules {
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub path_prefixes: Vec<String>,
}

/// Capture-tool options frozen onto a job when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOptions {
    pub workers: u32,
    #[serde(default)]
    pub stall_timeout_mins: Option<u32>,
    #[serde(default)]
    pub restart_budget: Option<u32>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            stall_timeout_mins: None,
            restart_budget: None,
        }
    }
}

/// A logical origin of captures.
#[derive(Debug, Clone)]
pub struct Source {
    pub code: String,
    pub name: String,
    pub seeds: Vec<String>,
    pub scope: ScopeRules,
}

/// Input for creating a job in `queued`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub source_code: String,
    pub name: String,
    pub output_dir: PathBuf,
    pub seeds: Vec<String>,
    pub scope: ScopeRules,
    pub options: CaptureOptions,
    pub max_retries: u32,
    pub campaign_order: Option<i64>,
}

/// Crawl progress counters reported by the capture subprocess.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlProgress {
    pub pages_crawled: i64,
    pub pages_total: i64,
    pub pages_failed: i64,
}

/// One capture attempt lifecycle for a source, as stored.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub source_code: String,
    pub name: String,
    pub output_dir: PathBuf,
    pub seeds: Vec<String>,
    pub scope: ScopeRules,
    pub options: CaptureOptions,
    pub status: JobStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub campaign_order: Option<i64>,
    pub infra_error_cooldown_until: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub last_error: Option<String>,
    pub progress: CrawlProgress,
    pub warc_count: i64,
    pub indexed_page_count: i64,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub indexed_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

/// One HTTP response read out of an archive file.
#[derive(Debug, Clone)]
pub struct ArchiveRecord {
    /// `WARC-Record-ID`, unique within the job's archive set.
    pub record_id: String,
    pub target_uri: String,
    /// Raw `WARC-Date` value.
    pub warc_date: Option<String>,
    pub http_status: Option<u16>,
    /// HTTP response headers, names lowercased.
    pub headers: Vec<(String, String)>,
    /// Payload after transfer and content decoding.
    pub body: Vec<u8>,
}

impl ArchiveRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Bare MIME type of the HTTP payload, lowercased, parameters removed.
    pub fn mime_type(&self) -> String {
        self.header("content-type")
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn is_html(&self) -> bool {
        matches!(
            self.mime_type().as_str(),
            "text/html" | "application/xhtml+xml"
        )
    }
}

/// Persisted result of indexing one HTML response.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub job_id: String,
    pub source_code: String,
    pub url: String,
    pub normalized_url_group: String,
    pub captured_at: DateTime<Utc>,
    /// Set when `WARC-Date` could not be parsed and indexing time was used.
    pub capture_time_inferred: bool,
    pub title: String,
    pub snippet: String,
    pub language: String,
    pub content_hash: String,
    pub warc_file: String,
    pub warc_record_id: String,
    pub mime_type: String,
    pub status_code: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn html_detection_ignores_parameters() {
        let record = ArchiveRecord {
            record_id: "<urn:uuid:1>".to_string(),
            target_uri: "https://example.org/".to_string(),
            warc_date: None,
            http_status: Some(200),
            headers: vec![(
                "content-type".to_string(),
                "Text/HTML; charset=UTF-8".to_string(),
            )],
            body: Vec::new(),
        };
        assert_eq!(record.mime_type(), "text/html");
        assert!(record.is_html());
    }
}
