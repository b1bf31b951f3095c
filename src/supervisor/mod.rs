//! Worker process supervision.
//!
//! One [`Supervisor`] owns a slot per configured [`WorkerKind`]. Control
//! actions and the watchdog both go through the slot's lock, so a kind is
//! never started twice concurrently.
//!
//! A worker counts as running if either the owned child is alive or the
//! [`ProcessProbe`] finds a process carrying the worker's identity. That keeps
//! a coordinator restart from spawning duplicates next to workers it no
//! longer owns.

mod logfile;
mod probe;
mod watchdog;

pub use logfile::{RotatingLog, RotatingWriter};
pub use probe::{platform_probe, ProcessProbe, SystemProbe};
pub use watchdog::{spawn_watchdog, WatchdogHandle};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pulsewatch_types::{format_timestamp, WorkerKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::health::{classify, read_heartbeat, HealthPolicy, StaleReason};
use crate::store::{self, DocumentStore};

/// How to launch one worker kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub kind: WorkerKind,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Command-line fragment that identifies this worker in the process
    /// table. Defaults to the file name of the last argument, or of the
    /// program when there are no arguments.
    #[serde(default)]
    pub identity: Option<String>,
    pub heartbeat: PathBuf,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkerSpec {
    pub fn identity(&self) -> String {
        if let Some(identity) = self.identity.as_deref().map(str::trim) {
            if !identity.is_empty() {
                return identity.to_string();
            }
        }
        let source = match self.args.last() {
            Some(arg) => Path::new(arg),
            None => self.program.as_path(),
        };
        source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Timing and log settings for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub tick: Duration,
    /// Age after which a running worker is force-restarted.
    pub rotation: Duration,
    pub rotation_pause: Duration,
    pub restart_pause: Duration,
    /// How long a worker gets to exit after the graceful signal.
    pub stop_timeout: Duration,
    pub health: HealthPolicy,
    pub log_dir: PathBuf,
    pub log_max_bytes: u64,
    pub log_backups: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            rotation: Duration::from_secs(3600),
            rotation_pause: Duration::from_secs(5),
            restart_pause: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
            health: HealthPolicy::default(),
            log_dir: PathBuf::from("runtime/logs"),
            log_max_bytes: 20 * 1024 * 1024,
            log_backups: 5,
        }
    }
}

/// Errors from lifecycle operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no worker configured for {0}")]
    NotConfigured(WorkerKind),

    #[error("failed to spawn {kind} worker `{program}`: {source}")]
    Spawn {
        kind: WorkerKind,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An operator control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    StartAll,
    StopAll,
    RestartAll,
    Start(WorkerKind),
    Stop(WorkerKind),
    Restart(WorkerKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for ControlAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let unknown = || UnknownAction(s.to_string());
        let (verb, target) = s.split_once('_').ok_or_else(unknown)?;
        if target == "all" {
            return match verb {
                "start" => Ok(ControlAction::StartAll),
                "stop" => Ok(ControlAction::StopAll),
                "restart" => Ok(ControlAction::RestartAll),
                _ => Err(unknown()),
            };
        }
        let kind: WorkerKind = target.parse().map_err(|_| unknown())?;
        match verb {
            "start" => Ok(ControlAction::Start(kind)),
            "stop" => Ok(ControlAction::Stop(kind)),
            "restart" => Ok(ControlAction::Restart(kind)),
            _ => Err(unknown()),
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAction::StartAll => f.write_str("start_all"),
            ControlAction::StopAll => f.write_str("stop_all"),
            ControlAction::RestartAll => f.write_str("restart_all"),
            ControlAction::Start(kind) => write!(f, "start_{kind}"),
            ControlAction::Stop(kind) => write!(f, "stop_{kind}"),
            ControlAction::Restart(kind) => write!(f, "restart_{kind}"),
        }
    }
}

/// Point-in-time view of one worker slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub kind: WorkerKind,
    pub configured: bool,
    pub running: bool,
    pub expected_running: bool,
    pub pid: Option<u32>,
    pub started_at_utc: Option<String>,
    pub restarts: u64,
    pub last_stale_reason: Option<&'static str>,
    pub last_spawn_error: Option<String>,
}

impl WorkerStatus {
    fn unconfigured(kind: WorkerKind) -> Self {
        Self {
            kind,
            configured: false,
            running: false,
            expected_running: false,
            pid: None,
            started_at_utc: None,
            restarts: 0,
            last_stale_reason: None,
            last_spawn_error: None,
        }
    }
}

type StatusView = Arc<parking_lot::Mutex<WorkerStatus>>;

#[derive(Debug)]
struct Slot {
    spec: WorkerSpec,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    expected_running: bool,
    restarts: u64,
    last_stale_reason: Option<StaleReason>,
    last_spawn_error: Option<String>,
    view: StatusView,
}

impl Slot {
    fn new(spec: WorkerSpec, view: StatusView) -> Self {
        Self {
            spec,
            child: None,
            pid: None,
            started_at: None,
            expected_running: false,
            restarts: 0,
            last_stale_reason: None,
            last_spawn_error: None,
            view,
        }
    }

    fn kind(&self) -> WorkerKind {
        self.spec.kind
    }

    /// Drop the child handle if it has exited.
    fn reap(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                warn!(kind = %self.spec.kind, pid = ?self.pid, %status, "worker exited");
                self.clear();
            }
            Err(e) => {
                warn!(kind = %self.spec.kind, error = %e, "failed to poll worker");
                self.clear();
            }
        }
    }

    fn clear(&mut self) {
        self.child = None;
        self.pid = None;
        self.started_at = None;
    }

    fn owns_live_child(&mut self) -> bool {
        self.reap();
        self.child.is_some()
    }

    /// Copy the slot into the view served while the slot is busy.
    ///
    /// `pid` is only set while a worker is known to be alive.
    fn publish(&self) -> WorkerStatus {
        let status = WorkerStatus {
            kind: self.kind(),
            configured: true,
            running: self.child.is_some() || self.pid.is_some(),
            expected_running: self.expected_running,
            pid: self.pid,
            started_at_utc: self.started_at.map(format_timestamp),
            restarts: self.restarts,
            last_stale_reason: self.last_stale_reason.map(|r| r.as_str()),
            last_spawn_error: self.last_spawn_error.clone(),
        };
        *self.view.lock() = status.clone();
        status
    }
}

#[derive(Debug)]
struct SlotCell {
    slot: Mutex<Slot>,
    view: StatusView,
}

/// Owns worker lifecycles.
#[derive(Debug)]
pub struct Supervisor {
    slots: BTreeMap<WorkerKind, SlotCell>,
    probe: Arc<dyn ProcessProbe>,
    store: Arc<dyn DocumentStore>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        workers: Vec<WorkerSpec>,
        probe: Arc<dyn ProcessProbe>,
        store: Arc<dyn DocumentStore>,
        settings: SupervisorSettings,
    ) -> Self {
        let slots = workers
            .into_iter()
            .map(|spec| {
                let kind = spec.kind;
                let view = Arc::new(parking_lot::Mutex::new(WorkerStatus {
                    configured: true,
                    ..WorkerStatus::unconfigured(kind)
                }));
                let slot = Mutex::new(Slot::new(spec, view.clone()));
                (kind, SlotCell { slot, view })
            })
            .collect();
        Self {
            slots,
            probe,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn kinds(&self) -> impl Iterator<Item = WorkerKind> + '_ {
        self.slots.keys().copied()
    }

    fn slot(&self, kind: WorkerKind) -> Result<&Mutex<Slot>, SupervisorError> {
        self.slots
            .get(&kind)
            .map(|cell| &cell.slot)
            .ok_or(SupervisorError::NotConfigured(kind))
    }

    /// Process table scan, off the async runtime.
    async fn find(&self, identity: String) -> Vec<u32> {
        let probe = self.probe.clone();
        match tokio::task::spawn_blocking(move || probe.find(&identity)).await {
            Ok(pids) => pids,
            Err(e) => {
                error!(error = %e, "process scan panicked");
                Vec::new()
            }
        }
    }

    /// Kill every process carrying `identity`. Returns the pids killed.
    async fn sweep(&self, identity: String) -> Vec<u32> {
        let probe = self.probe.clone();
        let swept = tokio::task::spawn_blocking(move || {
            let pids = probe.find(&identity);
            for pid in &pids {
                probe.kill(*pid);
            }
            pids
        })
        .await;
        match swept {
            Ok(pids) => pids,
            Err(e) => {
                error!(error = %e, "orphan sweep panicked");
                Vec::new()
            }
        }
    }

    /// Whether the owned child or a discovered process is alive.
    async fn is_running(&self, slot: &mut Slot) -> bool {
        if slot.owns_live_child() {
            return true;
        }
        let found = self.find(slot.spec.identity()).await;
        if let Some(pid) = found.first() {
            slot.pid.get_or_insert(*pid);
            return true;
        }
        slot.pid = None;
        false
    }

    /// Start a worker unless one is already running. Returns whether a new
    /// process was spawned.
    pub async fn start(&self, kind: WorkerKind) -> Result<bool, SupervisorError> {
        let mut slot = self.slot(kind)?.lock().await;
        self.start_locked(&mut slot, Utc::now()).await
    }

    /// Stop a worker and sweep any orphans carrying its identity.
    pub async fn stop(&self, kind: WorkerKind) -> Result<(), SupervisorError> {
        let mut slot = self.slot(kind)?.lock().await;
        self.stop_locked(&mut slot).await;
        Ok(())
    }

    pub async fn restart(&self, kind: WorkerKind) -> Result<bool, SupervisorError> {
        let mut slot = self.slot(kind)?.lock().await;
        self.restart_locked(&mut slot, self.settings.restart_pause, Utc::now())
            .await
    }

    /// Mark a kind expected-running without starting it; the watchdog starts
    /// it once there is work.
    pub async fn expect_running(&self, kind: WorkerKind) -> Result<(), SupervisorError> {
        let mut slot = self.slot(kind)?.lock().await;
        slot.expected_running = true;
        slot.publish();
        Ok(())
    }

    /// Apply an operator action. Unconfigured kinds are skipped.
    pub async fn control(&self, action: ControlAction) -> Result<(), SupervisorError> {
        let targets: Vec<WorkerKind> = match action {
            ControlAction::StartAll | ControlAction::StopAll | ControlAction::RestartAll => {
                self.kinds().collect()
            }
            ControlAction::Start(kind) | ControlAction::Stop(kind) | ControlAction::Restart(kind) => {
                vec![kind]
            }
        };
        info!(%action, "control action");
        for kind in targets {
            let result = match action {
                ControlAction::StartAll | ControlAction::Start(_) => self.start(kind).await.map(drop),
                ControlAction::StopAll | ControlAction::Stop(_) => self.stop(kind).await,
                ControlAction::RestartAll | ControlAction::Restart(_) => {
                    self.restart(kind).await.map(drop)
                }
            };
            match result {
                Ok(()) => {}
                Err(SupervisorError::NotConfigured(kind)) => {
                    warn!(%kind, "control action for unconfigured worker ignored");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Worker state for every kind. Never waits on a slot that is busy
    /// stopping or restarting; such a slot reports its last published view.
    pub async fn status(&self) -> Vec<WorkerStatus> {
        let mut out = Vec::with_capacity(WorkerKind::ALL.len());
        for kind in WorkerKind::ALL {
            let Some(cell) = self.slots.get(&kind) else {
                out.push(WorkerStatus::unconfigured(kind));
                continue;
            };
            let status = match cell.slot.try_lock() {
                Ok(mut slot) => {
                    self.is_running(&mut slot).await;
                    slot.publish()
                }
                Err(_) => cell.view.lock().clone(),
            };
            out.push(status);
        }
        out
    }

    async fn start_locked(
        &self,
        slot: &mut Slot,
        now: DateTime<Utc>,
    ) -> Result<bool, SupervisorError> {
        slot.expected_running = true;
        if self.is_running(slot).await {
            if slot.started_at.is_none() {
                slot.started_at = Some(now);
            }
            debug!(kind = %slot.kind(), pid = ?slot.pid, "worker already running");
            slot.publish();
            return Ok(false);
        }

        let result = match self.spawn(&slot.spec) {
            Ok(child) => {
                let pid = child.id();
                info!(kind = %slot.kind(), pid = ?pid, "worker started");
                slot.child = Some(child);
                slot.pid = pid;
                slot.started_at = Some(now);
                slot.last_spawn_error = None;
                Ok(true)
            }
            Err(e) => {
                slot.last_spawn_error = Some(e.to_string());
                Err(e)
            }
        };
        slot.publish();
        result
    }

    fn spawn(&self, spec: &WorkerSpec) -> Result<Child, SupervisorError> {
        let log = RotatingLog::new(
            self.settings.log_dir.join(format!("parser_{}.log", spec.kind)),
            self.settings.log_max_bytes,
            self.settings.log_backups,
        );
        let log_err = |source| SupervisorError::Log {
            path: log.path().to_path_buf(),
            source,
        };
        let stdout = log.open_append().map_err(log_err)?;
        let stderr = stdout.try_clone().map_err(log_err)?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        cmd.spawn().map_err(|source| SupervisorError::Spawn {
            kind: spec.kind,
            program: spec.program.display().to_string(),
            source,
        })
    }

    /// Graceful stop of the owned child: signal, wait, then kill.
    async fn terminate_child(&self, slot: &mut Slot) {
        let Some(mut child) = slot.child.take() else {
            return;
        };
        let kind = slot.kind();
        let signalled = child.id().is_some_and(|pid| self.probe.terminate(pid));
        if signalled {
            match tokio::time::timeout(self.settings.stop_timeout, child.wait()).await {
                Ok(_) => {
                    slot.clear();
                    slot.publish();
                    info!(%kind, "worker stopped");
                    return;
                }
                Err(_) => warn!(%kind, "worker ignored terminate, killing"),
            }
        }
        if let Err(e) = child.kill().await {
            warn!(%kind, error = %e, "failed to kill worker");
        }
        slot.clear();
        slot.publish();
        info!(%kind, "worker stopped");
    }

    async fn stop_locked(&self, slot: &mut Slot) {
        slot.expected_running = false;
        slot.reap();
        slot.publish();
        self.terminate_child(slot).await;
        for pid in self.sweep(slot.spec.identity()).await {
            info!(kind = %slot.kind(), pid, "killed orphaned worker");
        }
        slot.clear();
        slot.publish();
    }

    async fn restart_locked(
        &self,
        slot: &mut Slot,
        pause: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, SupervisorError> {
        self.stop_locked(slot).await;
        tokio::time::sleep(pause).await;
        self.start_locked(slot, now).await
    }

    async fn has_targets(&self, kind: WorkerKind) -> bool {
        let docs = self.store.clone();
        match tokio::task::spawn_blocking(move || store::has_targets(docs.as_ref(), kind)).await {
            Ok(Ok(has)) => has,
            Ok(Err(e)) => {
                warn!(%kind, error = %e, "could not scan documents for targets");
                false
            }
            Err(e) => {
                error!(%kind, error = %e, "target scan panicked");
                false
            }
        }
    }

    /// One watchdog pass over every configured kind.
    pub async fn tick(&self, now: DateTime<Utc>) {
        for (kind, cell) in &self.slots {
            let has_targets = self.has_targets(*kind).await;
            let mut slot = cell.slot.lock().await;
            self.tick_slot(&mut slot, has_targets, now).await;
        }
    }

    async fn tick_slot(&self, slot: &mut Slot, has_targets: bool, now: DateTime<Utc>) {
        let kind = slot.kind();

        if slot.owns_live_child() {
            if let Some(started) = slot.started_at {
                let age = (now - started).to_std().unwrap_or_default();
                if age >= self.settings.rotation {
                    info!(%kind, age_secs = age.as_secs(), "rotating worker");
                    self.terminate_child(slot).await;
                    tokio::time::sleep(self.settings.rotation_pause).await;
                    if let Err(e) = self.start_locked(slot, now).await {
                        error!(%kind, error = %e, "failed to start worker after rotation");
                    }
                }
            }
        }

        if !slot.expected_running || !has_targets {
            slot.publish();
            return;
        }

        if self.is_running(slot).await {
            let record = read_heartbeat(&slot.spec.heartbeat);
            let health = classify(record.as_ref(), slot.started_at, now, &self.settings.health);
            if let Some(reason) = health.reason() {
                warn!(%kind, %reason, "worker is stale, restarting");
                slot.last_stale_reason = Some(reason);
                slot.restarts += 1;
                if let Err(e) = self
                    .restart_locked(slot, self.settings.restart_pause, now)
                    .await
                {
                    error!(%kind, error = %e, "failed to restart stale worker");
                }
            } else {
                slot.publish();
            }
        } else {
            info!(%kind, "worker is down, starting");
            if let Err(e) = self.start_locked(slot, now).await {
                error!(%kind, error = %e, "failed to start worker");
            }
        }
    }
}
