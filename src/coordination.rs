//! On-disk coordination files shared by recovery coordinators and the
//! orchestrator.
//!
//! Nothing here talks to other processes directly. Every decision is made by
//! reading small JSON files under `recovery.state_dir`, and every update is
//! written to a temp file in the same directory and renamed over the old one.
//! The rate-limit counters are additionally read, checked and written while
//! holding a sibling `.lock` file, so two coordinators cannot both spend the
//! last unit of budget.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::CoordinationError;

pub const COUNTERS_FILE: &str = "recovery_counters.json";
pub const OBSERVATIONS_FILE: &str = "recovery_observations.json";

const MAX_LOCK_AGE_SECS: i64 = 365 * 24 * 3600;
/// A counters lock older than this belongs to a crashed process.
const STALE_STATE_LOCK_SECS: i64 = 60;
const STATE_LOCK_WAIT: StdDuration = StdDuration::from_secs(10);
const STATE_LOCK_RETRY: StdDuration = StdDuration::from_millis(20);

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, CoordinationError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(CoordinationError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content).map_err(|source| CoordinationError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CoordinationError> {
    let io_err = |source| CoordinationError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    let body = serde_json::to_vec_pretty(value).map_err(|source| CoordinationError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.write_all(&body).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

// ── Deploy lock ───────────────────────────────────────────────────────────

/// A maintenance lock file. While it is fresh, no automated transition may
/// be forced and the orchestrator does not pick new work.
///
/// The file holds the RFC 3339 time it was taken. A lock older than
/// `max_age` is treated as abandoned.
#[derive(Debug, Clone)]
pub struct DeployLock {
    path: PathBuf,
    max_age: Duration,
}

impl DeployLock {
    pub fn new(path: impl Into<PathBuf>, max_age_secs: i64) -> Self {
        Self {
            path: path.into(),
            max_age: Duration::seconds(max_age_secs.clamp(0, MAX_LOCK_AGE_SECS)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self, now: DateTime<Utc>) -> Result<(), CoordinationError> {
        let io_err = |source| CoordinationError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        std::fs::write(&self.path, now.to_rfc3339()).map_err(io_err)
    }

    pub fn release(&self) -> Result<(), CoordinationError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CoordinationError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Whether a fresh lock is present at `now`. Falls back to the file's
    /// modification time when the content is not a timestamp.
    pub fn is_held(&self, now: DateTime<Utc>) -> Result<bool, CoordinationError> {
        let io_err = |source| CoordinationError::Io {
            path: self.path.clone(),
            source,
        };
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(io_err(e)),
        };

        let taken_at = match DateTime::parse_from_rfc3339(content.trim()) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(_) => {
                let modified = std::fs::metadata(&self.path)
                    .and_then(|m| m.modified())
                    .map_err(io_err)?;
                DateTime::<Utc>::from(modified)
            }
        };

        if now - taken_at > self.max_age {
            warn!(path = %self.path.display(), taken_at = %taken_at, "ignoring stale deploy lock");
            return Ok(false);
        }
        Ok(true)
    }
}

// ── Rate limits ───────────────────────────────────────────────────────────

/// Exclusive hold on a state file, taken by creating `<file>.lock`.
///
/// Released on drop. A lock whose recorded time is older than
/// `STALE_STATE_LOCK_SECS` is removed and taken over.
struct StateLock {
    path: PathBuf,
}

impl StateLock {
    fn acquire(target: &Path) -> Result<Self, CoordinationError> {
        let mut name = target.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        let io_err = |source| CoordinationError::Io {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }

        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(Utc::now().to_rfc3339().as_bytes())
                        .map_err(io_err)?;
                    return Ok(Self { path: path.clone() });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(&path) {
                        warn!(path = %path.display(), "removing abandoned state lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() > STATE_LOCK_WAIT {
                        return Err(CoordinationError::Locked { path: path.clone() });
                    }
                    std::thread::sleep(STATE_LOCK_RETRY);
                }
                Err(e) => return Err(io_err(e)),
            }
        }
    }

    fn is_stale(path: &Path) -> bool {
        let Ok(content) = std::fs::read_to_string(path) else {
            return false;
        };
        let taken_at = match DateTime::parse_from_rfc3339(content.trim()) {
            Ok(ts) => ts.with_timezone(&Utc),
            // Created but not yet filled in by its holder, or never filled in
            Err(_) => match std::fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(_) => return false,
            },
        };
        Utc::now() - taken_at > Duration::seconds(STALE_STATE_LOCK_SECS)
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release state lock");
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counters {
    #[serde(default)]
    global: Vec<DateTime<Utc>>,
    #[serde(default)]
    per_job: BTreeMap<String, Vec<DateTime<Utc>>>,
}

impl Counters {
    fn recent(stamps: &[DateTime<Utc>], since: DateTime<Utc>) -> usize {
        stamps.iter().filter(|t| **t > since).count()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let day_ago = now - Duration::days(1);
        self.global.retain(|t| *t > day_ago);
        for stamps in self.per_job.values_mut() {
            stamps.retain(|t| *t > day_ago);
        }
        self.per_job.retain(|_, stamps| !stamps.is_empty());
    }
}

/// Forced-recovery budget: at most `per_job_per_day` per job in any rolling
/// 24 hours and `global_per_hour` across all jobs in any rolling hour.
///
/// The budget lives on disk and is shared by every coordinator process.
/// [`RateLimiter::allows`] answers from the last read; only
/// [`RateLimiter::try_spend`] is authoritative.
#[derive(Debug)]
pub struct RateLimiter {
    path: PathBuf,
    per_job_per_day: usize,
    global_per_hour: usize,
    counters: Counters,
}

impl RateLimiter {
    pub fn load(
        state_dir: &Path,
        per_job_per_day: usize,
        global_per_hour: usize,
    ) -> Result<Self, CoordinationError> {
        let path = state_dir.join(COUNTERS_FILE);
        let counters = load_json(&path)?;
        Ok(Self {
            path,
            per_job_per_day,
            global_per_hour,
            counters,
        })
    }

    /// Whether one more forced recovery of `job_id` fits in both windows,
    /// judged from the counters as last read.
    pub fn allows(&self, job_id: &str, now: DateTime<Utc>) -> bool {
        let global = Counters::recent(&self.counters.global, now - Duration::hours(1));
        if global >= self.global_per_hour {
            debug!(global, limit = self.global_per_hour, "global recovery budget exhausted");
            return false;
        }
        let per_job = self
            .counters
            .per_job
            .get(job_id)
            .map(|stamps| Counters::recent(stamps, now - Duration::days(1)))
            .unwrap_or(0);
        if per_job >= self.per_job_per_day {
            debug!(job_id, per_job, limit = self.per_job_per_day, "per-job recovery budget exhausted");
            return false;
        }
        true
    }

    /// Spend one forced recovery of `job_id` if the budget allows it.
    ///
    /// Re-reads the counters under the state lock, so concurrent
    /// coordinators see each other's spending. Returns `false` and writes
    /// nothing when either window is full.
    pub fn try_spend(&mut self, job_id: &str, now: DateTime<Utc>) -> Result<bool, CoordinationError> {
        let _lock = StateLock::acquire(&self.path)?;
        self.counters = load_json(&self.path)?;
        if !self.allows(job_id, now) {
            return Ok(false);
        }

        self.counters.prune(now);
        self.counters.global.push(now);
        self.counters
            .per_job
            .entry(job_id.to_string())
            .or_default()
            .push(now);
        save_json(&self.path, &self.counters)?;
        Ok(true)
    }
}

// ── Debounce ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Consecutive cycles the signal has been seen, including this one.
    pub cycles: u32,
}

/// Signals seen on previous observation cycles, keyed by `<kind>:<job_id>`.
///
/// A signal missing from a cycle is forgotten, so `cycles >= 2` means it was
/// seen on two consecutive cycles.
#[derive(Debug)]
pub struct ObservationLog {
    path: PathBuf,
    entries: BTreeMap<String, Observation>,
    seen: HashSet<String>,
}

impl ObservationLog {
    pub fn load(state_dir: &Path) -> Result<Self, CoordinationError> {
        let path = state_dir.join(OBSERVATIONS_FILE);
        let entries = load_json(&path)?;
        Ok(Self {
            path,
            entries,
            seen: HashSet::new(),
        })
    }

    pub fn observe(&mut self, key: &str, now: DateTime<Utc>) -> Observation {
        self.seen.insert(key.to_string());
        let entry = self
            .entries
            .entry(key.to_string())
            .and_modify(|o| {
                if o.last_seen < now {
                    o.cycles += 1;
                    o.last_seen = now;
                }
            })
            .or_insert(Observation {
                first_seen: now,
                last_seen: now,
                cycles: 1,
            });
        *entry
    }

    /// Forget a signal once it has been acted on.
    pub fn clear(&mut self, key: &str) {
        self.entries.remove(key);
        self.seen.remove(key);
    }

    /// Drop signals not observed this cycle and persist the rest.
    pub fn finish_cycle(mut self) -> Result<(), CoordinationError> {
        let seen = std::mem::take(&mut self.seen);
        self.entries.retain(|key, _| seen.contains(key));
        save_json(&self.path, &self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + Duration::minutes(minutes)
    }

    #[test]
    fn deploy_lock_expires() {
        let tmp = TempDir::new().unwrap();
        let lock = DeployLock::new(tmp.path().join("deploy.lock"), 3600);
        assert!(!lock.is_held(at(0)).unwrap());

        lock.acquire(at(0)).unwrap();
        assert!(lock.is_held(at(30)).unwrap());
        assert!(!lock.is_held(at(61)).unwrap());

        lock.release().unwrap();
        lock.release().unwrap();
        assert!(!lock.is_held(at(30)).unwrap());
    }

    #[test]
    fn rate_limits_survive_reload() {
        let tmp = TempDir::new().unwrap();
        let mut limiter = RateLimiter::load(tmp.path(), 2, 3).unwrap();
        assert!(limiter.allows("a", at(0)));
        assert!(limiter.try_spend("a", at(0)).unwrap());
        assert!(limiter.try_spend("a", at(1)).unwrap());
        assert!(!limiter.try_spend("a", at(2)).unwrap());
        assert!(limiter.allows("b", at(2)));

        let mut limiter = RateLimiter::load(tmp.path(), 2, 3).unwrap();
        assert!(!limiter.allows("a", at(2)));
        assert!(limiter.try_spend("b", at(2)).unwrap());
        // Global hourly cap reached
        assert!(!limiter.try_spend("c", at(3)).unwrap());
        // Window slides
        assert!(limiter.allows("c", at(62)));
        assert!(!limiter.allows("a", at(60 * 23)));
        assert!(limiter.allows("a", at(60 * 24 + 2)));
        assert!(!tmp.path().join("recovery_counters.json.lock").exists());
    }

    #[test]
    fn concurrent_limiters_share_the_budget() {
        let tmp = TempDir::new().unwrap();
        // Both loaded before either spends, as two coordinator processes would
        let mut first = RateLimiter::load(tmp.path(), 5, 1).unwrap();
        let mut second = RateLimiter::load(tmp.path(), 5, 1).unwrap();
        assert!(first.allows("a", at(0)));
        assert!(second.allows("b", at(0)));

        assert!(first.try_spend("a", at(0)).unwrap());
        assert!(!second.try_spend("b", at(0)).unwrap());

        let counters: Counters =
            load_json(&tmp.path().join(COUNTERS_FILE)).unwrap();
        assert_eq!(counters.global.len(), 1);
        assert!(counters.per_job.contains_key("a"));
    }

    #[test]
    fn stale_state_lock_is_taken_over() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("recovery_counters.json.lock");

        std::fs::write(&lock_path, (Utc::now() - Duration::hours(1)).to_rfc3339()).unwrap();
        let mut limiter = RateLimiter::load(tmp.path(), 5, 5).unwrap();
        assert!(limiter.try_spend("a", at(0)).unwrap());
        assert!(!lock_path.exists());

        let held = StateLock::acquire(&tmp.path().join(COUNTERS_FILE)).unwrap();
        assert!(lock_path.exists());
        drop(held);
        assert!(!lock_path.exists());
    }

    #[test]
    fn corrupt_counters_are_reported() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(COUNTERS_FILE), b"[[[").unwrap();
        assert!(matches!(
            RateLimiter::load(tmp.path(), 1, 1),
            Err(CoordinationError::Corrupt { .. })
        ));
    }

    #[test]
    fn debounce_needs_consecutive_cycles() {
        let tmp = TempDir::new().unwrap();

        let mut log = ObservationLog::load(tmp.path()).unwrap();
        assert_eq!(log.observe("stall:a", at(0)).cycles, 1);
        assert_eq!(log.observe("stall:b", at(0)).cycles, 1);
        log.finish_cycle().unwrap();

        let mut log = ObservationLog::load(tmp.path()).unwrap();
        let seen = log.observe("stall:a", at(1));
        assert_eq!(seen.cycles, 2);
        assert_eq!(seen.first_seen, at(0));
        log.finish_cycle().unwrap();

        // b skipped a cycle and starts over
        let mut log = ObservationLog::load(tmp.path()).unwrap();
        assert_eq!(log.observe("stall:b", at(2)).cycles, 1);
        log.clear("stall:a");
        log.finish_cycle().unwrap();

        let mut log = ObservationLog::load(tmp.path()).unwrap();
        assert_eq!(log.observe("stall:a", at(3)).cycles, 1);
    }
}
