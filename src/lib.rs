//! # Archive Harness
//!
//! Long-running web-archive capture jobs and the indexing of their output.
//!
//! A worker process polls the job store, claims one eligible job with an
//! atomic compare-and-set, supervises the external capture tool until it
//! exits, and then indexes the resulting WARC files into queryable
//! snapshots. Recovery coordinators run alongside and reset jobs that have
//! stalled or lost their storage, within strict rate limits.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!                 │  Job Store   │◀───────────────┐
//!                 │ (SQLite CAS) │                │
//!                 └──────┬───────┘                │
//!                        ▼                        │
//! ┌──────────────┐  ┌──────────────┐  ┌───────────┴──┐
//! │ Orchestrator │─▶│  Supervisor  │  │   Recovery   │
//! │ (poll loop)  │  │ (subprocess) │  │ stall/mount  │
//! └──────┬───────┘  └──────────────┘  └──────────────┘
//!        ▼
//! ┌──────────────────────────────────────────────┐
//! │ Pipeline: discovery → reader → extract → DB  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! arh init                      # create database
//! arh sources                   # sync configured sources
//! arh job add hc                # queue a capture
//! arh worker                    # run the orchestrator
//! arh recover                   # run recovery coordinators
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`jobs`] | Job store and compare-and-set transitions |
//! | [`state`] | Job state machine |
//! | [`supervisor`] | Capture subprocess supervision |
//! | [`orchestrator`] | Worker polling loop |
//! | [`discovery`] | Archive file discovery |
//! | [`warc`] | WARC record reader |
//! | [`extract`] | Per-record field extraction |
//! | [`pipeline`] | Indexing pipeline |
//! | [`coordination`] | Deploy lock, rate limits, debounce files |
//! | [`recovery`] | Stall and mount recovery coordinators |

pub mod config;
pub mod coordination;
pub mod db;
pub mod discovery;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod recovery;
pub mod sources;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod warc;
