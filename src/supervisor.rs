//! Capture supervision.
//!
//! A [`CaptureSupervisor`] runs the external capture tool for one job and
//! reports a [`CaptureDisposition`]. The orchestrator only ever sees the
//! disposition; it never inspects OS errors itself.
//!
//! [`ProcessSupervisor`] distinguishes a tool that launched and exited
//! nonzero from an environment that prevented launch. Only errors preparing
//! the output directory are checked against [`InfraErrorKind`]; a command
//! that cannot be spawned or waited on is a capture failure and consumes
//! retry budget.
//!
//! While the tool runs, the job row is re-read every
//! `capture.status_check_secs`. If something else moved the job out of
//! `running` (a recovery coordinator, usually), the child is killed and the
//! supervisor reports [`CaptureDisposition::Released`].

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::error::InfraErrorKind;
use crate::jobs::JobStore;
use crate::models::{CrawlProgress, Job, JobStatus};

const TAIL_LINES: usize = 5;
const LINE_BUFFER: usize = 256;
const WRITE_CHECK_FILE: &str = ".arh-write-check";

/// How one capture attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureDisposition {
    /// Exit code 0. Carries the last progress counters seen, if any.
    Success { progress: Option<CrawlProgress> },
    /// The tool ran and failed, or could not be launched. `exit_code` is
    /// `None` when there is no code to report.
    CaptureFailure {
        exit_code: Option<i64>,
        detail: String,
    },
    /// A recognised environmental failure on the output directory.
    InfrastructureFailure { kind: InfraErrorKind, detail: String },
    /// The job left `running` while the tool was still going; the child was
    /// killed and the attempt has no outcome to record.
    Released { status: JobStatus },
}

#[async_trait]
pub trait CaptureSupervisor: Send + Sync {
    /// Run the capture for `job` to completion. Progress is reported through
    /// `store` on a best-effort basis.
    async fn run(&self, job: &Job, store: &JobStore) -> CaptureDisposition;
}

/// Runs the configured capture command as a child process.
pub struct ProcessSupervisor {
    settings: CaptureConfig,
}

impl ProcessSupervisor {
    pub fn new(settings: CaptureConfig) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl CaptureSupervisor for ProcessSupervisor {
    async fn run(&self, job: &Job, store: &JobStore) -> CaptureDisposition {
        if let Err(e) = prepare_output_dir(&job.output_dir).await {
            return classify_prepare_error(&job.output_dir, e);
        }

        let args = render_args(&self.settings, job);
        info!(job_id = %job.id, command = %self.settings.command, ?args, "launching capture");

        let mut child = match Command::new(&self.settings.command)
            .args(&args)
            .current_dir(&job.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return launch_failure(&self.settings.command, "could not be started", e),
        };

        let (tx, mut lines) = mpsc::channel::<String>(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut status_check =
            tokio::time::interval(Duration::from_secs(self.settings.status_check_secs));
        status_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        status_check.tick().await;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
        let mut last: Option<CrawlProgress> = None;
        let mut streams_open = true;

        let exit = loop {
            tokio::select! {
                line = lines.recv(), if streams_open => match line {
                    Some(line) => {
                        debug!(target: "capture", job_id = %job.id, "{}", line);
                        if let Some(progress) = parse_progress(&line) {
                            let advanced = last
                                .map(|p| progress.pages_crawled > p.pages_crawled)
                                .unwrap_or(true);
                            if advanced {
                                if let Err(e) = store.record_progress(&job.id, progress, Utc::now()).await {
                                    warn!(job_id = %job.id, error = %e, "failed to record crawl progress");
                                }
                            }
                            last = Some(progress);
                        }
                        if tail.len() == TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                    None => streams_open = false,
                },
                exit = child.wait(), if !streams_open => break exit,
                _ = status_check.tick() => {
                    if let Some(status) = released(store, &job.id).await {
                        stop_child(&mut child, &job.id, status).await;
                        return CaptureDisposition::Released { status };
                    }
                }
            }
        };

        let status: ExitStatus = match exit {
            Ok(status) => status,
            Err(e) => return launch_failure(&self.settings.command, "could not be waited on", e),
        };

        if status.success() {
            info!(job_id = %job.id, "capture exited successfully");
            return CaptureDisposition::Success { progress: last };
        }

        let exit_code = status.code().map(i64::from);
        let mut detail = format!("capture exited with {}", status);
        if let Some(line) = tail.back() {
            detail.push_str(": ");
            detail.push_str(line);
        }
        warn!(job_id = %job.id, exit_code = ?exit_code, "capture failed");
        CaptureDisposition::CaptureFailure { exit_code, detail }
    }
}

/// Forward output lines from one pipe until EOF. Bytes that are not UTF-8
/// are replaced rather than ending the stream, so the pipe is always
/// drained.
async fn forward_lines<R: AsyncRead + Unpin>(stream: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "capture output stream closed");
                break;
            }
        }
    }
}

/// The stored status when the job is no longer `running`.
async fn released(store: &JobStore, job_id: &str) -> Option<JobStatus> {
    match store.get_job(job_id).await {
        Ok(Some(current)) if current.status != JobStatus::Running => Some(current.status),
        Ok(_) => None,
        Err(e) => {
            warn!(job_id, error = %e, "could not re-read job status during capture");
            None
        }
    }
}

async fn stop_child(child: &mut Child, job_id: &str, status: JobStatus) {
    warn!(job_id, status = %status, "job left running during capture, stopping the capture tool");
    if let Err(e) = child.kill().await {
        warn!(job_id, error = %e, "failed to kill capture tool");
    }
}

/// Make sure the output directory exists and is writable before launch.
async fn prepare_output_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::metadata(dir).await?;
    let marker = dir.join(WRITE_CHECK_FILE);
    tokio::fs::write(&marker, b"").await?;
    tokio::fs::remove_file(&marker).await?;
    Ok(())
}

fn classify_prepare_error(dir: &Path, err: std::io::Error) -> CaptureDisposition {
    let detail = format!("{}: {}", dir.display(), err);
    match InfraErrorKind::classify(&err) {
        Some(kind) => {
            warn!(output_dir = %dir.display(), kind = %kind, error = %err, "infrastructure failure before capture");
            CaptureDisposition::InfrastructureFailure { kind, detail }
        }
        None => {
            warn!(output_dir = %dir.display(), error = %err, "output directory could not be prepared");
            CaptureDisposition::CaptureFailure {
                exit_code: None,
                detail,
            }
        }
    }
}

fn launch_failure(command: &str, what: &str, err: std::io::Error) -> CaptureDisposition {
    warn!(command, error = %err, "capture command {}", what);
    CaptureDisposition::CaptureFailure {
        exit_code: None,
        detail: format!("capture command {} {}: {}", command, what, err),
    }
}

/// Expand the argument template for `job`.
///
/// Placeholders: `{seeds}` (comma separated), `{output_dir}`, `{job_id}`,
/// `{job_name}`, `{workers}`, `{allowed_hosts}`, `{path_prefixes}`,
/// `{stall_timeout_mins}`, `{restart_budget}`. An argument that expands to
/// an empty string is dropped together with a preceding `--flag`.
pub fn render_args(settings: &CaptureConfig, job: &Job) -> Vec<String> {
    let opt = |v: Option<u32>| v.map(|n| n.to_string()).unwrap_or_default();
    let values = [
        ("{seeds}", job.seeds.join(",")),
        ("{output_dir}", job.output_dir.display().to_string()),
        ("{job_id}", job.id.clone()),
        ("{job_name}", job.name.clone()),
        ("{workers}", job.options.workers.to_string()),
        ("{allowed_hosts}", job.scope.allowed_hosts.join(",")),
        ("{path_prefixes}", job.scope.path_prefixes.join(",")),
        ("{stall_timeout_mins}", opt(job.options.stall_timeout_mins)),
        ("{restart_budget}", opt(job.options.restart_budget)),
    ];

    let mut args: Vec<String> = Vec::with_capacity(settings.args.len());
    for template in &settings.args {
        let mut rendered = template.clone();
        for (key, value) in &values {
            rendered = rendered.replace(key, value);
        }
        if rendered.is_empty() && !template.is_empty() {
            if args.last().is_some_and(|prev| prev.starts_with("--")) {
                args.pop();
            }
            continue;
        }
        args.push(rendered);
    }
    args
}

/// Recognise a crawl-status line in the capture tool's output.
///
/// Accepts the JSON log form
/// `{"context":"crawlStatus","details":{"crawled":N,"total":M,"failed":F}}`
/// and the plain form `crawled: N/M` (optionally followed by `failed: F`).
pub fn parse_progress(line: &str) -> Option<CrawlProgress> {
    let line = line.trim();
    if line.starts_with('{') {
        let value: Value = serde_json::from_str(line).ok()?;
        if value.get("context")?.as_str()? != "crawlStatus" {
            return None;
        }
        let details = value.get("details")?;
        let field = |name: &str| details.get(name).and_then(Value::as_i64).unwrap_or(0);
        return Some(CrawlProgress {
            pages_crawled: details.get("crawled")?.as_i64()?,
            pages_total: field("total"),
            pages_failed: field("failed"),
        });
    }

    let lower = line.to_ascii_lowercase();
    let rest = &lower[lower.find("crawled:")? + "crawled:".len()..];
    let mut parts = rest.trim_start().splitn(2, '/');
    let crawled: i64 = leading_number(parts.next()?)?;
    let total = parts.next().and_then(leading_number).unwrap_or(0);
    let failed = lower
        .find("failed:")
        .and_then(|i| leading_number(lower[i + "failed:".len()..].trim_start()))
        .unwrap_or(0);

    Some(CrawlProgress {
        pages_crawled: crawled,
        pages_total: total,
        pages_failed: failed,
    })
}

fn leading_number(s: &str) -> Option<i64> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
