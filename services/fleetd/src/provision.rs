//! Provisioning collaborator contracts and mock implementations.
//!
//! The fleet controller never talks to the VM provider itself. Spawning,
//! teardown and health verification are delegated through these traits; the
//! production implementations run the actual provider workflows out of
//! process. Mock implementations are provided for testing and development.
//!
//! Both mutating collaborators take an `allowed_pre_state` guard: the action
//! applies only if the record is still in that state, so a call racing the
//! asynchronous event handler degrades to a no-op.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use kiln_store::{VmState, VmStore};

/// Creates VM provisioning attempts and tracks the ones still in flight.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Kick off provisioning of one new VM for the group.
    async fn start_spawn(&self, group: &str) -> Result<()>;

    /// Number of spawn attempts started but not yet reaped.
    fn in_flight(&self) -> usize;

    /// Reap finished spawn attempts so `in_flight` stays accurate.
    async fn recycle(&self);
}

/// Requests VM teardown.
#[async_trait]
pub trait Terminator: Send + Sync {
    /// Request termination of a VM, guarded on its expected current state.
    async fn start_termination(&self, vm_name: &str, allowed_pre_state: VmState) -> Result<()>;
}

/// Requests VM health verification.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Kick off a health check for a VM.
    async fn start_check(&self, vm_name: &str) -> Result<()>;

    /// Mark a VM whose check never completed as failed.
    async fn mark_check_failed(&self, vm_name: &str) -> Result<()>;
}

/// Mock spawner that only records calls.
///
/// The in-flight count is test-settable since the mock starts no real
/// provisioning work.
pub struct MockSpawner {
    in_flight: AtomicUsize,
    spawned: Mutex<Vec<String>>,
    recycles: AtomicUsize,
    fail_spawns: bool,
}

impl MockSpawner {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            spawned: Mutex::new(Vec::new()),
            recycles: AtomicUsize::new(0),
            fail_spawns: false,
        }
    }

    /// Create a mock spawner that fails every spawn attempt.
    pub fn failing() -> Self {
        Self {
            fail_spawns: true,
            ..Self::new()
        }
    }

    pub fn set_in_flight(&self, n: usize) {
        self.in_flight.store(n, Ordering::SeqCst);
    }

    /// Groups spawn attempts were delegated for, in order.
    pub async fn spawned(&self) -> Vec<String> {
        self.spawned.lock().await.clone()
    }

    pub fn recycle_count(&self) -> usize {
        self.recycles.load(Ordering::SeqCst)
    }
}

impl Default for MockSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Spawner for MockSpawner {
    async fn start_spawn(&self, group: &str) -> Result<()> {
        if self.fail_spawns {
            anyhow::bail!("mock spawner configured to fail");
        }
        info!(group, "[MOCK] starting spawn");
        self.spawned.lock().await.push(group.to_string());
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn recycle(&self) {
        self.recycles.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mock terminator that applies the guarded transition against the store.
///
/// Keeping the guard real means tests exercise the same race tolerance the
/// production terminator relies on.
pub struct MockTerminator {
    store: Arc<dyn VmStore>,
    requests: Mutex<Vec<(String, VmState)>>,
}

impl MockTerminator {
    pub fn new(store: Arc<dyn VmStore>) -> Self {
        Self {
            store,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Termination requests received, in order, with their guards.
    pub async fn requests(&self) -> Vec<(String, VmState)> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl Terminator for MockTerminator {
    async fn start_termination(&self, vm_name: &str, allowed_pre_state: VmState) -> Result<()> {
        self.requests
            .lock()
            .await
            .push((vm_name.to_string(), allowed_pre_state));
        let applied = self
            .store
            .set_state_guarded(vm_name, allowed_pre_state, VmState::Terminating)
            .await?;
        if applied {
            info!(vm = %vm_name, "[MOCK] termination started");
        } else {
            debug!(vm = %vm_name, "[MOCK] termination skipped, record moved on");
        }
        Ok(())
    }
}

/// Mock health checker.
///
/// `start_check` moves the record into `CheckHealth` from whatever state it
/// is currently in, mirroring the production checker's first step; the
/// transition also refreshes `last_health_check`.
pub struct MockChecker {
    store: Arc<dyn VmStore>,
    checks: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl MockChecker {
    pub fn new(store: Arc<dyn VmStore>) -> Self {
        Self {
            store,
            checks: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// VMs a check was requested for, in order.
    pub async fn checks(&self) -> Vec<String> {
        self.checks.lock().await.clone()
    }

    /// VMs marked check-failed, in order.
    pub async fn failures(&self) -> Vec<String> {
        self.failures.lock().await.clone()
    }
}

#[async_trait]
impl HealthChecker for MockChecker {
    async fn start_check(&self, vm_name: &str) -> Result<()> {
        self.checks.lock().await.push(vm_name.to_string());
        if let Some(record) = self.store.get_vm(vm_name).await? {
            self.store
                .set_state_guarded(vm_name, record.state, VmState::CheckHealth)
                .await?;
        }
        Ok(())
    }

    async fn mark_check_failed(&self, vm_name: &str) -> Result<()> {
        self.failures.lock().await.push(vm_name.to_string());
        self.store
            .set_state_guarded(vm_name, VmState::CheckHealth, VmState::CheckHealthFailed)
            .await?;
        Ok(())
    }
}
