//! Coordinator lifecycle.
//!
//! [`Coordinator`] wires the store, intake queue and supervisor together and
//! owns the background tasks: the intake consumer, the backup loop and the
//! watchdog. Workers are separate OS processes and are left running on
//! shutdown; the next coordinator finds them through the process probe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use pulsewatch_types::WorkerKind;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Settings;
use crate::data::EngineSettings;
use crate::intake::{Applier, ConsumerHandle, IntakeQueue};
use crate::store::{
    self, spawn_backup_loop, validate_on_startup, BackupHandle, DocumentStore, FileStore,
    TargetSummary, ValidationReport,
};
use crate::supervisor::{
    platform_probe, spawn_watchdog, ProcessProbe, Supervisor, WatchdogHandle, WorkerStatus,
};

/// Overall worker state for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallState {
    /// Nothing is tracked.
    Idle,
    /// Every kind with targets is running and every target has stats.
    Ok,
    Bad,
}

/// One kind's entry in [`ParserStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindStatus {
    #[serde(flatten)]
    pub worker: WorkerStatus,
    pub has_targets: bool,
    pub targets: usize,
    pub targets_with_stats: usize,
}

/// Response body of the parser status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParserStatus {
    pub ok: bool,
    pub state: OverallState,
    pub has_tasks: bool,
    pub workers: BTreeMap<WorkerKind, KindStatus>,
}

/// Derive the overall state from per-kind coverage.
pub fn overall_state(kinds: &[(bool, TargetSummary)]) -> OverallState {
    if kinds.iter().all(|(_, summary)| summary.targets == 0) {
        return OverallState::Idle;
    }
    let healthy = kinds
        .iter()
        .filter(|(_, summary)| summary.targets > 0)
        .all(|(running, summary)| *running && summary.complete());
    if healthy {
        OverallState::Ok
    } else {
        OverallState::Bad
    }
}

/// Validate every document and exit. Used by `--check`.
pub fn check_documents(settings: &Settings) -> Result<ValidationReport> {
    let s = &settings.store;
    validate_on_startup(&s.data_dir, &s.backup_dir, &s.quarantine_dir, Utc::now())
        .context("failed to validate documents")
}

#[derive(Debug)]
struct Tasks {
    consumer: ConsumerHandle,
    backup: BackupHandle,
    watchdog: Option<WatchdogHandle>,
}

/// The running service.
#[derive(Debug)]
pub struct Coordinator {
    settings: Settings,
    store: Arc<FileStore>,
    intake: Arc<IntakeQueue>,
    supervisor: Arc<Supervisor>,
    engine: EngineSettings,
    tasks: Mutex<Option<Tasks>>,
}

impl Coordinator {
    /// Prepare directories, check documents and build the services.
    pub fn init(settings: Settings) -> Result<Self> {
        Self::with_probe(settings, platform_probe())
    }

    /// [`Coordinator::init`] with a specific process probe.
    pub fn with_probe(settings: Settings, probe: Arc<dyn ProcessProbe>) -> Result<Self> {
        for dir in [&settings.store.data_dir, &settings.store.runtime_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let report = check_documents(&settings)?;
        info!(
            total = report.total,
            ok = report.ok,
            restored = report.restored,
            invalid = report.invalid,
            "document check complete"
        );

        let store = Arc::new(FileStore::new(&settings.store.data_dir));
        let intake = Arc::new(IntakeQueue::new(settings.intake.capacity));
        let supervisor = Arc::new(Supervisor::new(
            settings.workers.clone(),
            probe,
            store.clone(),
            settings.supervisor_settings(),
        ));
        let engine = settings.engine();

        Ok(Self {
            settings,
            store,
            intake,
            supervisor,
            engine,
            tasks: Mutex::new(None),
        })
    }

    /// Start the background tasks. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Ok(());
        }

        let applier = Arc::new(Applier::new(self.store.clone(), self.engine.clone()));
        let poll = Duration::from_millis(self.settings.intake.poll_interval_ms.max(1));
        let consumer = self
            .intake
            .start_consumer(applier, poll)
            .context("intake consumer was already started")?;

        let backup = spawn_backup_loop(
            self.settings.store.data_dir.clone(),
            self.settings.store.backup_dir.clone(),
            Duration::from_secs(self.settings.store.backup_interval_secs.max(1)),
        );

        let watchdog = if self.settings.supervisor.enabled {
            if self.settings.supervisor.autostart {
                for kind in self.supervisor.kinds().collect::<Vec<_>>() {
                    self.supervisor.expect_running(kind).await?;
                }
            }
            Some(spawn_watchdog(
                self.supervisor.clone(),
                self.supervisor.settings().tick,
            ))
        } else {
            warn!("supervisor disabled, workers will not be watched");
            None
        };

        *tasks = Some(Tasks {
            consumer,
            backup,
            watchdog,
        });
        info!("coordinator started");
        Ok(())
    }

    /// Stop the background tasks. Workers keep running.
    pub async fn shutdown(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        if let Some(watchdog) = tasks.watchdog {
            watchdog.shutdown().await;
        }
        tasks.consumer.shutdown().await;
        tasks.backup.shutdown().await;
        info!("coordinator stopped");
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn intake(&self) -> &IntakeQueue {
        &self.intake
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    /// Per-kind worker state plus target coverage.
    pub async fn parser_status(&self) -> Result<ParserStatus> {
        let docs = self.store.clone();
        let docs = tokio::task::spawn_blocking(move || store::load_all(docs.as_ref()))
            .await
            .context("document scan panicked")??;

        let mut workers = BTreeMap::new();
        let mut coverage = Vec::new();
        for worker in self.supervisor.status().await {
            let summary = store::target_summary(&docs, worker.kind);
            coverage.push((worker.running, summary));
            workers.insert(
                worker.kind,
                KindStatus {
                    has_targets: summary.targets > 0,
                    targets: summary.targets,
                    targets_with_stats: summary.with_stats,
                    worker,
                },
            );
        }

        Ok(ParserStatus {
            ok: true,
            state: overall_state(&coverage),
            has_tasks: coverage.iter().any(|(_, s)| s.targets > 0),
            workers,
        })
    }
}
