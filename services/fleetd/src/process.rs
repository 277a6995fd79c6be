//! Worker-process liveness probing for the dead-builder audit.

use std::collections::HashMap;
use std::sync::Mutex;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::debug;

/// Checks whether a builder process still exists and still works on a VM.
pub trait ProcessInspector: Send + Sync {
    /// True if `pid` is alive and its command line references `vm_name`.
    fn worker_alive(&self, pid: u32, vm_name: &str) -> bool;
}

/// Inspector backed by signal-0 probing and `/proc`.
pub struct ProcInspector;

impl ProcessInspector for ProcInspector {
    fn worker_alive(&self, pid: u32, vm_name: &str) -> bool {
        if kill(Pid::from_raw(pid as i32), None).is_err() {
            debug!(pid, "process gone");
            return false;
        }
        let Ok(raw) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
            return false;
        };
        let cmdline = String::from_utf8_lossy(&raw);
        // workers carry the VM name in argv[0] via their process title
        cmdline
            .split('\0')
            .next()
            .is_some_and(|argv0| argv0.contains(vm_name))
    }
}

/// Mock inspector with a settable pid → VM-name table.
#[derive(Default)]
pub struct MockInspector {
    workers: Mutex<HashMap<u32, String>>,
}

impl MockInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live worker process for `vm_name`.
    pub fn add_worker(&self, pid: u32, vm_name: &str) {
        self.workers
            .lock()
            .unwrap()
            .insert(pid, vm_name.to_string());
    }

    /// Simulate the worker process dying.
    pub fn kill_worker(&self, pid: u32) {
        self.workers.lock().unwrap().remove(&pid);
    }
}

impl ProcessInspector for MockInspector {
    fn worker_alive(&self, pid: u32, vm_name: &str) -> bool {
        self.workers
            .lock()
            .unwrap()
            .get(&pid)
            .is_some_and(|name| name == vm_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_inspector_tracks_workers() {
        let inspector = MockInspector::new();
        inspector.add_worker(4242, "builder-1");

        assert!(inspector.worker_alive(4242, "builder-1"));
        assert!(!inspector.worker_alive(4242, "builder-2"));
        assert!(!inspector.worker_alive(4243, "builder-1"));

        inspector.kill_worker(4242);
        assert!(!inspector.worker_alive(4242, "builder-1"));
    }

    #[test]
    fn proc_inspector_rejects_dead_pid() {
        let inspector = ProcInspector;
        // pid from the far end of the range, almost certainly unused
        assert!(!inspector.worker_alive(u32::MAX / 2, "builder-1"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_inspector_rejects_mismatched_cmdline() {
        let inspector = ProcInspector;
        // our own pid is alive, but argv[0] is the test binary
        assert!(!inspector.worker_alive(std::process::id(), "no-such-vm-name"));
    }
}
