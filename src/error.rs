//! Error taxonomy for capture supervision and indexing.
//!
//! Record- and file-level errors ([`ArchiveReadError`]) are always recovered
//! locally by the pipeline. Job-level failures end up as a status plus a
//! detail string on the job row.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::{Actor, JobStatus};

/// Environmental failure classes recognised by the capture supervisor.
///
/// Anything outside this set is treated as a capture failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfraErrorKind {
    /// Stale NFS handle or a mount whose transport endpoint went away.
    StaleMount,
    /// Permission denied on the job's output directory.
    PermissionDenied,
}

impl InfraErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraErrorKind::StaleMount => "stale_mount",
            InfraErrorKind::PermissionDenied => "permission_denied",
        }
    }

    /// Classify an I/O error, or `None` when it is not a recognised
    /// environmental failure.
    pub fn classify(err: &std::io::Error) -> Option<Self> {
        // ESTALE and ENOTCONN on Linux
        const ESTALE: i32 = 116;
        const ENOTCONN: i32 = 107;

        if err.kind() == std::io::ErrorKind::PermissionDenied {
            return Some(InfraErrorKind::PermissionDenied);
        }
        match err.raw_os_error() {
            Some(ESTALE) | Some(ENOTCONN) => Some(InfraErrorKind::StaleMount),
            _ => None,
        }
    }
}

impl std::fmt::Display for InfraErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reading one archive file or one record inside it.
#[derive(Debug, Error)]
pub enum ArchiveReadError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error at record {record_index}: {source}")]
    Io {
        record_index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed record {record_index}: {reason}")]
    Malformed { record_index: usize, reason: String },
    #[error("truncated record {record_index}: expected {expected} bytes, got {actual}")]
    Truncated {
        record_index: usize,
        expected: usize,
        actual: usize,
    },
}

/// Pipeline failures that fail the whole job with `index_failed`.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("output directory {path} is not readable: {source}")]
    OutputUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no archive files found for job {job_id} although {pages_crawled} pages were crawled")]
    NoArchives { job_id: String, pages_crawled: i64 },
    #[error("database error while indexing: {0}")]
    Store(#[from] sqlx::Error),
}

/// A transition the state machine does not allow.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal transition {from} -> {to} by {actor}")]
pub struct IllegalTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub actor: Actor,
}

/// Failure reading or writing a coordination file.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("coordination file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("coordination file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("timed out waiting for state lock {path}")]
    Locked { path: PathBuf },
}
