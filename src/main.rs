//! # Archive Harness CLI (`arh`)
//!
//! ## Usage
//!
//! ```bash
//! arh --config ./config/arh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `arh init` | Create the SQLite database and schema |
//! | `arh sources` | List configured sources and sync them to the database |
//! | `arh job add <source>` | Queue a capture job |
//! | `arh job list` | List jobs, optionally by status |
//! | `arh job show <id>` | Show one job with counters and recent events |
//! | `arh worker` | Run the orchestrator polling loop |
//! | `arh index <id>` | Re-index a `completed` or `index_failed` job |
//! | `arh recover` | Run the stall and mount recovery coordinators |

use archive_harness::models::JobStatus;
use archive_harness::{
    config, logging, migrate, orchestrator, pipeline, recovery, sources, status,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Archive Harness: web-archive capture jobs and snapshot indexing.
#[derive(Parser)]
#[command(
    name = "arh",
    about = "Archive Harness: supervise web-archive captures and index their WARC output",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/arh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// List configured sources and sync them into the database.
    Sources,

    /// Manage capture jobs.
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Run the orchestrator.
    ///
    /// Polls for queued and retryable jobs, runs the capture tool for one
    /// job at a time, and indexes successful captures. Stops between poll
    /// cycles on Ctrl-C.
    Worker {
        /// Run a single poll cycle and exit.
        #[arg(long)]
        once: bool,
    },

    /// Explicitly (re-)index a completed or index_failed job.
    ///
    /// Already indexed records are left untouched; only missing snapshots
    /// are inserted.
    Index {
        /// Job ID.
        id: String,
    },

    /// Run the recovery coordinators.
    ///
    /// Forces stalled or unreachable running jobs back to retryable,
    /// subject to debounce, rate limits, and the deploy lock.
    Recover {
        /// Run a single observation cycle and exit.
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Queue a new capture job for a configured source.
    Add {
        /// Source code from `[sources.<code>]`.
        source: String,

        /// Job name. Defaults to `<source>-<timestamp>`.
        #[arg(long)]
        name: Option<String>,

        /// Campaign position. Lower values are picked first.
        #[arg(long)]
        campaign: Option<i64>,
    },

    /// List jobs.
    List {
        /// Only show jobs in this status.
        #[arg(long)]
        status: Option<String>,
    },

    /// Show a job's counters, last error, and recent events.
    Show {
        /// Job ID.
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg).await?;
        }
        Commands::Job { action } => match action {
            JobAction::Add {
                source,
                name,
                campaign,
            } => {
                status::run_job_add(&cfg, &source, name.as_deref(), campaign).await?;
            }
            JobAction::List { status: filter } => {
                let filter = filter.map(|s| s.parse::<JobStatus>()).transpose()?;
                status::run_job_list(&cfg, filter).await?;
            }
            JobAction::Show { id } => {
                status::run_job_show(&cfg, &id).await?;
            }
        },
        Commands::Worker { once } => {
            orchestrator::run_worker(&cfg, once).await?;
        }
        Commands::Index { id } => {
            pipeline::run_index(&cfg, &id).await?;
        }
        Commands::Recover { once } => {
            recovery::run_recovery(&cfg, once).await?;
        }
    }

    Ok(())
}
