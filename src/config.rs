//! Coordinator settings.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `PULSEWATCH__SECTION__KEY` environment variables. The legacy
//! variable names older deployments use are applied last.
//!
//! ```toml
//! [server]
//! listen_addr = "127.0.0.1:8000"
//!
//! [intake]
//! capacity = 500
//!
//! [[workers]]
//! kind = "posts"
//! program = "python3"
//! args = ["-u", "ParserPost.py"]
//! heartbeat = "runtime/parser_health_posts.json"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::FixedOffset;
use config::{Config, ConfigError, Environment, File};
use pulsewatch_types::{msk, WorkerKind};
use serde::{Deserialize, Serialize};

use crate::data::EngineSettings;
use crate::health::HealthPolicy;
use crate::supervisor::{SupervisorSettings, WorkerSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_addr: String,
    /// Shared secret producers send in `X-Parser-Token`. Unset or blank
    /// disables the check.
    pub token: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8000".to_string(),
            token: None,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    /// Holds the instance lock and worker heartbeats.
    pub runtime_dir: PathBuf,
    pub backup_interval_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/users"),
            backup_dir: PathBuf::from("data/backup"),
            quarantine_dir: PathBuf::from("data/quarantine"),
            runtime_dir: PathBuf::from("runtime"),
            backup_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeSettings {
    pub capacity: usize,
    pub poll_interval_ms: u64,
}

impl Default for IntakeSettings {
    fn default() -> Self {
        Self {
            capacity: crate::intake::DEFAULT_CAPACITY,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub grace_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            grace_secs: 90,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub enabled: bool,
    /// Mark every configured worker expected-running at startup.
    pub autostart: bool,
    pub tick_secs: u64,
    pub rotation_secs: u64,
    pub rotation_pause_secs: u64,
    pub restart_pause_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            autostart: true,
            tick_secs: 5,
            rotation_secs: 3600,
            rotation_pause_secs: 5,
            restart_pause_secs: 1,
            stop_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub dir: PathBuf,
    pub file_name: String,
    pub max_bytes: u64,
    pub backups: usize,
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("runtime/logs"),
            file_name: "server.log".to_string(),
            max_bytes: 20 * 1024 * 1024,
            backups: 5,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    /// UTC offset of the zone used for hour range labels.
    pub display_offset_hours: i32,
    pub follower_retention_days: i64,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            display_offset_hours: 3,
            follower_retention_days: 8,
        }
    }
}

/// All coordinator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub intake: IntakeSettings,
    pub health: HealthSettings,
    pub supervisor: SupervisorSection,
    pub logging: LoggingSettings,
    pub tracking: TrackingSettings,
    pub workers: Vec<WorkerSpec>,
}

impl Default for Settings {
    fn default() -> Self {
        let runtime = StoreSettings::default().runtime_dir;
        let worker = |kind: WorkerKind, script: &str| WorkerSpec {
            kind,
            program: PathBuf::from("python3"),
            args: vec!["-u".to_string(), script.to_string()],
            identity: None,
            heartbeat: runtime.join(kind.heartbeat_file_name()),
            cwd: None,
            env: BTreeMap::from([("PYTHONIOENCODING".to_string(), "utf-8".to_string())]),
        };
        Self {
            server: ServerSettings::default(),
            store: StoreSettings::default(),
            intake: IntakeSettings::default(),
            health: HealthSettings::default(),
            supervisor: SupervisorSection::default(),
            logging: LoggingSettings::default(),
            tracking: TrackingSettings::default(),
            workers: vec![
                worker(WorkerKind::Posts, "ParserPost.py"),
                worker(WorkerKind::Accounts, "ACCSPARSER.py"),
            ],
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional file, and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // Missing keys fall back to `Default` through `#[serde(default)]`.
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("PULSEWATCH")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.apply_legacy_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Apply the legacy environment variables through `lookup`.
    pub fn apply_legacy_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(capacity) = number("PARSER_EVENT_QUEUE_SIZE") {
            self.intake.capacity = capacity as usize;
        }
        if let Some(token) = lookup("PARSER_INTERNAL_TOKEN") {
            self.server.token = Some(token);
        }
        if let Some(secs) = number("JSON_BD_BACKUP_INTERVAL_SEC") {
            self.store.backup_interval_secs = secs;
        }
        if let Some(bytes) = number("APP_LOG_MAX_BYTES") {
            self.logging.max_bytes = bytes;
        }
        if let Some(count) = number("APP_LOG_BACKUP_COUNT") {
            self.logging.backups = count as usize;
        }
        if let Some(python) = lookup("PARSER_PYTHON") {
            let mut parts = python.split_whitespace().map(str::to_string);
            if let Some(program) = parts.next() {
                let prefix: Vec<String> = parts.collect();
                for worker in &mut self.workers {
                    worker.program = PathBuf::from(&program);
                    let mut args = prefix.clone();
                    args.append(&mut worker.args);
                    worker.args = args;
                }
            }
        }
    }

    /// The configured token, if any. Blank means unset.
    pub fn token(&self) -> Option<&str> {
        self.server
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn instance_lock_path(&self) -> PathBuf {
        self.store.runtime_dir.join("main.lock")
    }

    pub fn log_path(&self) -> PathBuf {
        self.logging.dir.join(&self.logging.file_name)
    }

    pub fn display_zone(&self) -> FixedOffset {
        FixedOffset::east_opt(self.tracking.display_offset_hours * 3600).unwrap_or_else(msk)
    }

    pub fn engine(&self) -> EngineSettings {
        EngineSettings {
            display_zone: self.display_zone(),
            follower_retention: chrono::Duration::days(self.tracking.follower_retention_days),
            ..EngineSettings::default()
        }
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            grace: Duration::from_secs(self.health.grace_secs),
            timeout: Duration::from_secs(self.health.timeout_secs),
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let s = &self.supervisor;
        SupervisorSettings {
            tick: Duration::from_secs(s.tick_secs.max(1)),
            rotation: Duration::from_secs(s.rotation_secs),
            rotation_pause: Duration::from_secs(s.rotation_pause_secs),
            restart_pause: Duration::from_secs(s.restart_pause_secs),
            stop_timeout: Duration::from_secs(s.stop_timeout_secs),
            health: self.health_policy(),
            log_dir: self.logging.dir.clone(),
            log_max_bytes: self.logging.max_bytes,
            log_backups: self.logging.backups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.intake.capacity, 200);
        assert_eq!(s.store.backup_interval_secs, 3600);
        assert_eq!(s.instance_lock_path(), PathBuf::from("runtime/main.lock"));
        assert_eq!(s.log_path(), PathBuf::from("runtime/logs/server.log"));
        assert_eq!(s.workers.len(), 2);
        assert_eq!(
            s.workers[0].heartbeat,
            PathBuf::from("runtime/parser_health_posts.json")
        );
        assert_eq!(s.workers[0].identity(), "ParserPost.py");
        assert_eq!(s.display_zone(), msk());
        assert_eq!(s.token(), None);
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
listen_addr = "0.0.0.0:9000"
token = "  "

[intake]
capacity = 7

[[workers]]
kind = "accounts"
program = "/opt/worker"
heartbeat = "/tmp/hb.json"
"#
        )
        .unwrap();

        let s = Settings::load(Some(file.path())).unwrap();
        assert_eq!(s.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(s.intake.capacity, 7);
        assert_eq!(s.intake.poll_interval_ms, 1000);
        assert_eq!(s.token(), None);
        assert_eq!(s.workers.len(), 1);
        assert_eq!(s.workers[0].kind, WorkerKind::Accounts);
        assert_eq!(s.workers[0].identity(), "worker");
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/pulsewatch.toml"))).is_err());
    }

    #[test]
    fn legacy_env_names_apply_last() {
        let env: BTreeMap<&str, &str> = BTreeMap::from([
            ("PARSER_EVENT_QUEUE_SIZE", "50"),
            ("PARSER_INTERNAL_TOKEN", "s3cret"),
            ("JSON_BD_BACKUP_INTERVAL_SEC", "60"),
            ("APP_LOG_MAX_BYTES", "1024"),
            ("APP_LOG_BACKUP_COUNT", "not-a-number"),
            ("PARSER_PYTHON", "py -3.13"),
        ]);
        let mut s = Settings::default();
        s.apply_legacy_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(s.intake.capacity, 50);
        assert_eq!(s.token(), Some("s3cret"));
        assert_eq!(s.store.backup_interval_secs, 60);
        assert_eq!(s.logging.max_bytes, 1024);
        assert_eq!(s.logging.backups, 5);
        assert_eq!(s.workers[0].program, PathBuf::from("py"));
        assert_eq!(s.workers[0].args, vec!["-3.13", "-u", "ParserPost.py"]);
        assert_eq!(s.supervisor_settings().log_max_bytes, 1024);
    }
}
