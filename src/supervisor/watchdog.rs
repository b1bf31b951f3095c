//! Periodic supervision loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::Supervisor;

/// Handle to the running watchdog.
#[derive(Debug)]
pub struct WatchdogHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchdogHandle {
    /// Stop after the current tick completes.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

/// Run [`Supervisor::tick`] every `every` until stopped.
pub fn spawn_watchdog(supervisor: Arc<Supervisor>, every: Duration) -> WatchdogHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        info!(tick_secs = every.as_secs_f64(), "watchdog started");
        let mut timer = tokio::time::interval(every);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => supervisor.tick(Utc::now()).await,
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("watchdog stopped");
    });

    WatchdogHandle { stop_tx, task }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use crate::supervisor::{platform_probe, SupervisorSettings, WorkerSpec};
    use pulsewatch_types::WorkerKind;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[tokio::test]
    async fn watchdog_brings_expected_worker_up() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("alice.json"), r#"{"accounts": ["@bob"]}"#).unwrap();

        let marker = format!("pulsewatch-wd-{}", std::process::id());
        let spec = WorkerSpec {
            kind: WorkerKind::Accounts,
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "sleep 30".into(), marker.clone()],
            identity: Some(marker),
            heartbeat: dir.path().join("parser_health_accounts.json"),
            cwd: None,
            env: BTreeMap::new(),
        };
        let settings = SupervisorSettings {
            log_dir: dir.path().join("logs"),
            ..SupervisorSettings::default()
        };
        let supervisor = Arc::new(super::Supervisor::new(
            vec![spec],
            platform_probe(),
            Arc::new(FileStore::new(data)),
            settings,
        ));
        supervisor.expect_running(WorkerKind::Accounts).await.unwrap();

        let handle = spawn_watchdog(supervisor.clone(), Duration::from_millis(20));
        let mut running = false;
        for _ in 0..100 {
            let status = supervisor.status().await;
            if status.iter().any(|s| s.kind == WorkerKind::Accounts && s.running) {
                running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.shutdown().await;
        supervisor.stop(WorkerKind::Accounts).await.unwrap();
        assert!(running);
    }
}
