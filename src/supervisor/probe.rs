//! OS process enumeration and signalling.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System, UpdateKind};

/// Finds and signals worker processes by command-line identity.
///
/// The supervisor never trusts its own child handle alone: a worker started
/// by an earlier coordinator run is still found here and counted as running.
pub trait ProcessProbe: Send + Sync + Debug {
    /// Pids of live processes whose command line mentions `identity`.
    fn find(&self, identity: &str) -> Vec<u32>;

    /// Ask a process to exit. Returns false if no graceful signal could be
    /// delivered.
    fn terminate(&self, pid: u32) -> bool;

    /// Kill a process outright.
    fn kill(&self, pid: u32) -> bool;
}

/// Probe backed by the system process table.
#[derive(Debug)]
pub struct SystemProbe {
    system: Mutex<System>,
    own_pid: Option<Pid>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            own_pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProbe {
    fn find(&self, identity: &str) -> Vec<u32> {
        let needle = identity.to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let mut system = self.system.lock();
        // Command lines are not part of the default refresh.
        system.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));
        let mut pids: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(pid, _)| Some(**pid) != self.own_pid)
            .filter(|(_, p)| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .filter(|(_, p)| p.cmd().iter().any(|arg| arg.to_lowercase().contains(&needle)))
            .map(|(pid, _)| pid.as_u32())
            .collect();
        pids.sort_unstable();
        pids
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid as NixPid;
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        kill(NixPid::from_raw(raw), Signal::SIGTERM).is_ok()
    }

    #[cfg(not(unix))]
    fn terminate(&self, _pid: u32) -> bool {
        false
    }

    fn kill(&self, pid: u32) -> bool {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        if !system.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
            return false;
        }
        system.process(pid).is_some_and(|p| p.kill())
    }
}

/// The probe for the current platform.
pub fn platform_probe() -> Arc<dyn ProcessProbe> {
    Arc::new(SystemProbe::new())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_probe_skips_itself_and_blank_identities() {
        let probe = SystemProbe::new();
        assert!(probe.find("").is_empty());
        let own = std::process::id();
        // Our own command line always contains the test binary name.
        let exe = std::env::args().next().unwrap_or_default();
        let name = std::path::Path::new(&exe)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        assert!(!probe.find(&name).contains(&own));
    }

    #[cfg(unix)]
    #[test]
    fn system_probe_finds_and_kills_children() {
        let marker = format!("{}", 424_242 + std::process::id() % 1000);
        let mut child = std::process::Command::new("sleep")
            .arg(format!("30.{marker}"))
            .spawn()
            .unwrap();
        let probe = SystemProbe::new();
        // The child may not have exec'd yet on the first scan.
        let mut found = Vec::new();
        for _ in 0..50 {
            found = probe.find(&marker);
            if !found.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(found, vec![child.id()]);
        assert!(probe.kill(child.id()));
        child.wait().unwrap();
        assert!(probe.find(&marker).is_empty());
    }
}
