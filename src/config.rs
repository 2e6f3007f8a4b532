use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub worker: WorkerConfig,
    pub capture: CaptureConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Directory under which each job's output directory is created.
    pub output_root: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_infra_cooldown_secs")]
    pub infra_cooldown_secs: i64,
    #[serde(default = "default_min_free_disk_bytes")]
    pub min_free_disk_bytes: u64,
    /// Global ceiling on jobs in `running`, across every worker process.
    #[serde(default = "default_max_running_jobs")]
    pub max_running_jobs: i64,
}

fn default_poll_interval_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_infra_cooldown_secs() -> i64 {
    600
}
fn default_min_free_disk_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}
fn default_max_running_jobs() -> i64 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    pub command: String,
    #[serde(default = "default_capture_args")]
    pub args: Vec<String>,
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default)]
    pub stall_timeout_mins: Option<u32>,
    #[serde(default)]
    pub restart_budget: Option<u32>,
    /// How often a running capture re-reads its job row.
    #[serde(default = "default_status_check_secs")]
    pub status_check_secs: u64,
}

fn default_capture_args() -> Vec<String> {
    vec![
        "--seeds".to_string(),
        "{seeds}".to_string(),
        "--output".to_string(),
        "{output_dir}".to_string(),
        "--name".to_string(),
        "{job_name}".to_string(),
        "--workers".to_string(),
        "{workers}".to_string(),
    ]
}
fn default_workers() -> u32 {
    1
}
fn default_status_check_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    #[serde(default = "default_max_file_secs")]
    pub max_file_secs: u64,
    #[serde(default = "default_html_only")]
    pub html_only: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            snippet_chars: default_snippet_chars(),
            max_file_secs: default_max_file_secs(),
            html_only: default_html_only(),
        }
    }
}

fn default_snippet_chars() -> usize {
    280
}
fn default_max_file_secs() -> u64 {
    1800
}
fn default_html_only() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoveryConfig {
    /// Directory holding the rate-limit, debounce, and cooldown files.
    pub state_dir: PathBuf,
    #[serde(default = "default_stall_after_mins")]
    pub stall_after_mins: i64,
    #[serde(default = "default_min_failure_secs")]
    pub min_failure_secs: i64,
    #[serde(default = "default_max_per_job_per_day")]
    pub max_per_job_per_day: usize,
    #[serde(default = "default_max_global_per_hour")]
    pub max_global_per_hour: usize,
    #[serde(default)]
    pub deploy_lock_path: Option<PathBuf>,
    #[serde(default = "default_deploy_lock_max_age_secs")]
    pub deploy_lock_max_age_secs: i64,
    #[serde(default = "default_recovery_interval_secs")]
    pub interval_secs: u64,
}

fn default_stall_after_mins() -> i64 {
    30
}
fn default_min_failure_secs() -> i64 {
    600
}
fn default_max_per_job_per_day() -> usize {
    3
}
fn default_max_global_per_hour() -> usize {
    5
}
fn default_deploy_lock_max_age_secs() -> i64 {
    7200
}
fn default_recovery_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub seeds: Vec<String>,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default)]
    pub path_prefixes: Vec<String>,
}

impl RecoveryConfig {
    /// The deploy lock defaults to `<state_dir>/deploy.lock`.
    pub fn deploy_lock(&self) -> PathBuf {
        self.deploy_lock_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("deploy.lock"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

const MAX_WINDOW_SECS: i64 = 30 * 24 * 3600;

fn check_range(key: &str, value: i64, min: i64, max: i64) -> Result<()> {
    if value < min || value > max {
        anyhow::bail!("{} must be between {} and {} (got {})", key, min, max, value);
    }
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    if config.worker.max_retries == 0 {
        anyhow::bail!("worker.max_retries must be >= 1");
    }
    check_range("worker.infra_cooldown_secs", config.worker.infra_cooldown_secs, 0, MAX_WINDOW_SECS)?;
    if config.worker.max_running_jobs < 1 {
        anyhow::bail!("worker.max_running_jobs must be >= 1");
    }

    if config.capture.command.trim().is_empty() {
        anyhow::bail!("capture.command must not be empty");
    }
    if config.capture.status_check_secs == 0 {
        anyhow::bail!("capture.status_check_secs must be >= 1");
    }

    if config.indexing.snippet_chars == 0 {
        anyhow::bail!("indexing.snippet_chars must be > 0");
    }

    let recovery = &config.recovery;
    if recovery.max_per_job_per_day == 0 {
        anyhow::bail!("recovery.max_per_job_per_day must be >= 1");
    }
    if recovery.max_global_per_hour == 0 {
        anyhow::bail!("recovery.max_global_per_hour must be >= 1");
    }
    check_range("recovery.stall_after_mins", recovery.stall_after_mins, 1, MAX_WINDOW_SECS / 60)?;
    check_range("recovery.min_failure_secs", recovery.min_failure_secs, 0, MAX_WINDOW_SECS)?;
    check_range(
        "recovery.deploy_lock_max_age_secs",
        recovery.deploy_lock_max_age_secs,
        1,
        MAX_WINDOW_SECS,
    )?;

    for (code, source) in &config.sources {
        if source.seeds.is_empty() {
            anyhow::bail!("sources.{}.seeds must contain at least one URL", code);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/arh.sqlite"

[worker]
output_root = "/tmp/jobs"

[capture]
command = "crawl"

[recovery]
state_dir = "/tmp/recovery"

[sources.hc]
name = "Health Canada"
seeds = ["https://www.canada.ca/en/health-canada.html"]
"#;

    #[test]
    fn defaults_fill_in() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.worker.infra_cooldown_secs, 600);
        assert_eq!(config.indexing.snippet_chars, 280);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(
            config.recovery.deploy_lock(),
            PathBuf::from("/tmp/recovery/deploy.lock")
        );
        assert_eq!(config.sources["hc"].seeds.len(), 1);
    }

    #[test]
    fn rejects_zero_retries() {
        let text = MINIMAL.replace(
            "output_root = \"/tmp/jobs\"",
            "output_root = \"/tmp/jobs\"\nmax_retries = 0",
        );
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_source_without_seeds() {
        let text = MINIMAL.replace(
            "seeds = [\"https://www.canada.ca/en/health-canada.html\"]",
            "seeds = []",
        );
        let config: Config = toml::from_str(&text).unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_out_of_range_windows() {
        for (section, line) in [
            ("[worker]", "infra_cooldown_secs = 9223372036854775807"),
            ("[worker]", "infra_cooldown_secs = -1"),
            ("[recovery]", "stall_after_mins = 100000000000"),
            ("[recovery]", "min_failure_secs = -5"),
            ("[recovery]", "deploy_lock_max_age_secs = 0"),
            ("[recovery]", "deploy_lock_max_age_secs = 9223372036854775807"),
        ] {
            let text = MINIMAL.replace(section, &format!("{}\n{}", section, line));
            let config: Config = toml::from_str(&text).unwrap();
            let err = validate(&config).unwrap_err().to_string();
            assert!(err.contains("must be between"), "{}: {}", line, err);
        }
    }
}
