//! The fleet controller: the cyclic loop that keeps the VM pool healthy.
//!
//! Every cycle audits the full VM set in fixed order:
//!
//! 1. Reclaim dirty VMs (released to one requester, never re-acquired)
//! 2. Request health checks for VMs whose last check went stale
//! 3. Spawn new VMs per group, subject to capacity and rate gates
//! 4. Reclaim VMs whose builder process died, rescheduling their work
//! 5. Fail health checks that have been in flight too long
//! 6. Retry timed-out terminations, deduplicating on address reuse
//! 7. Reap finished spawn attempts
//!
//! The controller holds no record exclusively: the event handler advances
//! records concurrently, so every read here is a volatile snapshot and every
//! mutation passes an expected-prior-state guard.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use kiln_store::{unix_now, VmRecord, VmState, VmStore};

use crate::config::{Config, GroupLimits};
use crate::events::EventHandler;
use crate::process::ProcessInspector;
use crate::provision::{HealthChecker, Spawner, Terminator};

/// Channel reschedule notifications are published on.
pub const RESCHEDULE_CHANNEL: &str = "kiln:rescheduling";

/// States counted against a group's spawn capacity.
const SPAWN_COUNTED_STATES: &[VmState] = &[
    VmState::GotIp,
    VmState::Ready,
    VmState::InUse,
    VmState::CheckHealth,
    VmState::CheckHealthFailed,
];

/// States subject to the periodic health audit.
const HEALTH_AUDIT_STATES: &[VmState] = &[
    VmState::CheckHealthFailed,
    VmState::Ready,
    VmState::GotIp,
    VmState::InUse,
];

/// Fleet controller.
pub struct FleetController {
    store: Arc<dyn VmStore>,
    spawner: Arc<dyn Spawner>,
    terminator: Arc<dyn Terminator>,
    checker: Arc<dyn HealthChecker>,
    inspector: Arc<dyn ProcessInspector>,
    events: Arc<dyn EventHandler>,
    config: Config,
}

impl FleetController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn VmStore>,
        spawner: Arc<dyn Spawner>,
        terminator: Arc<dyn Terminator>,
        checker: Arc<dyn HealthChecker>,
        inspector: Arc<dyn ProcessInspector>,
        events: Arc<dyn EventHandler>,
        config: Config,
    ) -> Self {
        Self {
            store,
            spawner,
            terminator,
            checker,
            inspector,
            events,
            config,
        }
    }

    /// Run the control loop until shutdown.
    ///
    /// Registers the server start, launches the event handler, then ticks
    /// every `cycle_interval`. A failed cycle is logged and the loop
    /// continues; a bad record or collaborator hiccup must never stop the
    /// controller.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.config.validate()?;
        self.store.mark_server_start(unix_now()).await?;

        let events_task = tokio::spawn(Arc::clone(&self.events).run(shutdown.clone()));

        info!(
            cycle_interval_secs = self.config.thresholds.cycle_interval.as_secs(),
            groups = self.config.groups.len(),
            "fleet controller started"
        );

        let mut interval = tokio::time::interval(self.config.thresholds.cycle_interval);
        // skip the immediate first tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "fleet cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("fleet controller shutting down");
                        break;
                    }
                }
            }
        }

        if let Err(e) = events_task.await {
            error!(error = %e, "event handler task panicked");
        }
        Ok(())
    }

    /// Execute one full fleet cycle.
    pub async fn run_cycle(&self) -> Result<()> {
        debug!("starting fleet cycle");

        self.reclaim_dirty_vms().await?;
        self.audit_health().await?;
        self.spawn_if_required().await?;

        self.reclaim_dead_builders().await?;
        self.finalize_stuck_checks().await?;
        self.retry_terminations().await?;

        self.spawner.recycle().await;
        Ok(())
    }

    /// Terminate `Ready` VMs reserved for a requester who never came back.
    ///
    /// Guarded on `Ready` so a reclamation racing a fresh acquisition is a
    /// no-op.
    async fn reclaim_dirty_vms(&self) -> Result<()> {
        for vmd in self.store.list_vms(None, &[VmState::Ready]).await? {
            if vmd.bound_to_user.is_none() {
                continue;
            }
            let Some(last_release) = vmd.last_release else {
                continue;
            };
            let Some(limits) = self.group_limits(&vmd) else {
                continue;
            };
            let unclaimed_for = unix_now() - last_release;
            if unclaimed_for > limits.dirty_vm_timeout.as_secs() as i64 {
                info!(
                    vm = %vmd.name,
                    unclaimed_secs = unclaimed_for,
                    "dirty VM not re-acquired, terminating"
                );
                self.terminator
                    .start_termination(&vmd.name, VmState::Ready)
                    .await?;
            }
        }
        Ok(())
    }

    /// Request a health check for every VM whose last check went stale.
    ///
    /// The request itself does not change record state; that is the
    /// checker's and event handler's business.
    async fn audit_health(&self) -> Result<()> {
        let period = self.config.thresholds.health_check_period.as_secs() as i64;
        for vmd in self.store.list_vms(None, HEALTH_AUDIT_STATES).await? {
            let stale = vmd
                .last_health_check
                .is_none_or(|at| unix_now() - at > period);
            if stale {
                self.checker.start_check(&vmd.name).await?;
            }
        }
        Ok(())
    }

    /// Try to spawn one VM per group.
    async fn spawn_if_required(&self) -> Result<()> {
        let mut groups: Vec<_> = self.config.groups.iter().collect();
        groups.sort_by(|a, b| a.0.cmp(b.0));
        for (group, limits) in groups {
            self.try_spawn_one(group, limits).await?;
        }
        Ok(())
    }

    /// Spawn a new VM for the group if every gate passes:
    ///
    /// 1. active VMs plus in-flight spawn attempts below `max_vm_total`
    /// 2. the group's last spawn-attempt start outside `spawn_min_interval`
    /// 3. in-flight spawn attempts below `max_spawn_processes`
    /// 4. fail-safe: total VMs of any state below
    ///    `failsafe_multiplier * max_vm_total`
    ///
    /// The attempt timestamp is recorded before delegating, so a slow or
    /// failing attempt still throttles the next one.
    async fn try_spawn_one(&self, group: &str, limits: &GroupLimits) -> Result<()> {
        let active = self.store.list_vms(Some(group), SPAWN_COUNTED_STATES).await?;
        let in_flight = self.spawner.in_flight();
        if active.len() + in_flight >= limits.max_vm_total {
            debug!(
                group,
                vm_count = active.len(),
                in_flight,
                "skip spawn: group at capacity"
            );
            return Ok(());
        }

        if let Some(last_start) = self.store.last_spawn_attempt(group).await? {
            let elapsed = unix_now() - last_start;
            if elapsed < limits.spawn_min_interval.as_secs() as i64 {
                debug!(group, elapsed_secs = elapsed, "skip spawn: inside rate window");
                return Ok(());
            }
        }

        if in_flight >= limits.max_spawn_processes {
            debug!(group, in_flight, "skip spawn: max spawn processes reached");
            return Ok(());
        }

        let total = self.store.list_group(group).await?.len();
        let failsafe_cap =
            self.config.thresholds.failsafe_multiplier as usize * limits.max_vm_total;
        if total >= failsafe_cap {
            warn!(group, total, failsafe_cap, "skip spawn: fail-safe cap reached");
            return Ok(());
        }

        info!(group, "spawning new VM");
        self.store.record_spawn_attempt(group, unix_now()).await?;
        if let Err(e) = self.spawner.start_spawn(group).await {
            error!(group, error = %e, "spawn attempt failed");
        }
        Ok(())
    }

    /// Reclaim `InUse` VMs whose builder process is gone.
    ///
    /// The audit waits out a grace window after acquisition so the worker
    /// has time to register its identity, then verifies the owning process
    /// is alive and still working on this VM.
    async fn reclaim_dead_builders(&self) -> Result<()> {
        let grace = self.config.thresholds.dead_builder_grace.as_secs() as i64;
        for vmd in self.store.list_vms(None, &[VmState::InUse]).await? {
            let (Some(in_use_since), Some(pid)) = (vmd.in_use_since, vmd.used_by_pid) else {
                continue;
            };
            if unix_now() - in_use_since < grace {
                continue;
            }
            if self.inspector.worker_alive(pid, &vmd.name) {
                continue;
            }

            info!(vm = %vmd.name, pid, "builder process gone, terminating VM");
            self.terminator
                .start_termination(&vmd.name, VmState::InUse)
                .await?;
            self.request_reschedule(&vmd).await?;
        }
        Ok(())
    }

    /// Publish a reschedule request for the work item bound to a reclaimed
    /// VM. Requires all three identifying fields; otherwise there is
    /// nothing a consumer could requeue.
    async fn request_reschedule(&self, vmd: &VmRecord) -> Result<()> {
        let (Some(build_id), Some(task_id), Some(chroot)) =
            (&vmd.build_id, &vmd.task_id, &vmd.chroot)
        else {
            debug!(vm = %vmd.name, "record carries no complete work item, not rescheduling");
            return Ok(());
        };
        let request = serde_json::json!({
            "action": "reschedule",
            "build_id": build_id,
            "task_id": task_id,
            "chroot": chroot,
        });
        info!(vm = %vmd.name, build_id = %build_id, task_id = %task_id, "publishing reschedule");
        self.store.publish(RESCHEDULE_CHANNEL, request).await?;
        Ok(())
    }

    /// Fail health checks that have been in flight past the maximum.
    ///
    /// After a controller crash or a lost callback a VM could sit in
    /// `CheckHealth` forever; forcing it to `CheckHealthFailed` puts it
    /// back on the retry cadence.
    async fn finalize_stuck_checks(&self) -> Result<()> {
        let max = self.config.thresholds.health_check_max_duration.as_secs() as i64;
        for vmd in self.store.list_vms(None, &[VmState::CheckHealth]).await? {
            let elapsed = unix_now() - vmd.last_health_check.unwrap_or(0);
            if elapsed > max {
                info!(
                    vm = %vmd.name,
                    elapsed_secs = elapsed,
                    "health check stuck, marking failed"
                );
                self.checker.mark_check_failed(&vmd.name).await?;
            }
        }
        Ok(())
    }

    /// Re-request terminations that never confirmed.
    ///
    /// If another record already holds this VM's address, the provider
    /// re-assigned it and the teardown evidently happened; re-requesting
    /// would be unsafe, so the stale record is dropped instead.
    async fn retry_terminations(&self) -> Result<()> {
        let timeout = self.config.thresholds.terminating_timeout.as_secs() as i64;
        for vmd in self.store.list_vms(None, &[VmState::Terminating]).await? {
            let elapsed = unix_now() - vmd.terminating_since.unwrap_or(0);
            if elapsed <= timeout {
                continue;
            }

            let collided = match vmd.ip.as_deref() {
                Some(ip) => self.store.lookup_by_ip(ip).await?.len() > 1,
                None => false,
            };
            if collided {
                info!(
                    vm = %vmd.name,
                    ip = vmd.ip.as_deref().unwrap_or(""),
                    "address reused by a newer VM, dropping stale record"
                );
                self.store.remove_vm(&vmd.name).await?;
            } else {
                info!(vm = %vmd.name, "requesting termination again");
                self.terminator
                    .start_termination(&vmd.name, VmState::Terminating)
                    .await?;
            }
        }
        Ok(())
    }

    fn group_limits(&self, vmd: &VmRecord) -> Option<&GroupLimits> {
        let limits = self.config.groups.get(&vmd.group);
        if limits.is_none() {
            warn!(vm = %vmd.name, group = %vmd.group, "VM belongs to an unconfigured group");
        }
        limits
    }
}
