//! # pulsewatch
//!
//! A coordinator for engagement-tracking workers.
//!
//! Two external worker processes (one scraping posts, one scraping
//! accounts) report stats snapshots over HTTP. The coordinator is the only
//! writer of the per-user JSON documents: it merges snapshots into
//! timelines, settles 24-hour hourly windows, and keeps the workers alive.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Coordinator                            │
//! │                                                                  │
//! │  workers ──HTTP──▶ ┌────────┐   ┌────────┐   ┌──────┐   ┌───────┐ │
//! │                    │ server │──▶│ intake │──▶│ data │──▶│ store │ │
//! │                    └───┬────┘   └────────┘   └──────┘   └───┬───┘ │
//! │                        │ control                            │     │
//! │                        ▼                                    │     │
//! │  heartbeats ──▶ ┌────────────┐ ◀── has targets? ────────────┘     │
//! │                 │ supervisor │──▶ spawn / stop / restart workers  │
//! │                 └────────────┘                                   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **[`app`]**: [`Coordinator`] lifecycle (`init` / `start` / `shutdown`)
//! - **[`server`]**: internal HTTP endpoints on hyper
//! - **[`intake`]**: bounded queue and its single consumer
//! - **[`data`]**: timeline merge, tracking windows and hourly deltas
//! - **[`store`]**: JSON documents with atomic writes, locks, backups and
//!   startup recovery
//! - **[`health`]**: heartbeat classification
//! - **[`supervisor`]**: worker processes, the watchdog and child logs
//! - **[`config`]**: layered [`Settings`]
//!
//! ## Usage
//!
//! ```bash
//! # Run with defaults (listens on 127.0.0.1:8000)
//! pulsewatch
//!
//! # Use a settings file and accept events only
//! pulsewatch --config pulsewatch.toml --no-supervisor
//!
//! # Repair stored documents and exit
//! pulsewatch --check
//! ```
//!
//! ### As a library
//!
//! ```no_run
//! use std::sync::Arc;
//! use pulsewatch::{Coordinator, Settings};
//!
//! # tokio_test::block_on(async {
//! let coordinator = Arc::new(Coordinator::init(Settings::default()).unwrap());
//! coordinator.start().await.unwrap();
//! let status = coordinator.parser_status().await.unwrap();
//! println!("{:?}", status.state);
//! coordinator.shutdown().await;
//! # });
//! ```

pub mod app;
pub mod config;
pub mod data;
pub mod health;
pub mod intake;
pub mod server;
pub mod store;
pub mod supervisor;

pub use app::{Coordinator, OverallState, ParserStatus};
pub use config::Settings;
pub use data::{EngineSettings, Timeline, TrackingWindow};
pub use health::{classify, Health, HealthPolicy, StaleReason};
pub use intake::{IntakeQueue, IntakeStatus, SubmitError};
pub use store::{DocumentStore, FileStore, StoreError};
pub use supervisor::{ControlAction, ProcessProbe, Supervisor, WorkerSpec, WorkerStatus};

pub use pulsewatch_types::{EventType, HealthRecord, ParserEvent, WorkerKind};
