//! The shared-store contract consumed by the fleet controller.
//!
//! The store is the single source of truth for VM descriptors. It offers
//! atomic per-record reads and writes plus a state-guarded compare-and-set,
//! but no multi-record transactions; callers must tolerate benign staleness
//! between a read and a subsequent guarded mutation.

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{VmRecord, VmState};

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vm not found: {0}")]
    NotFound(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Shared-store contract.
///
/// A production deployment backs this with an external store; the in-memory
/// [`MemoryStore`](crate::MemoryStore) implementation ships for tests and
/// development.
#[async_trait]
pub trait VmStore: Send + Sync {
    /// Fetch one VM's descriptor.
    async fn get_vm(&self, name: &str) -> Result<Option<VmRecord>, StoreError>;

    /// Insert or replace a VM descriptor.
    async fn upsert_vm(&self, record: &VmRecord) -> Result<(), StoreError>;

    /// Remove a VM descriptor. Removing an unknown VM is not an error.
    async fn remove_vm(&self, name: &str) -> Result<(), StoreError>;

    /// List VMs whose state is in `states`, optionally restricted to one
    /// group. An empty state list matches nothing.
    async fn list_vms(
        &self,
        group: Option<&str>,
        states: &[VmState],
    ) -> Result<Vec<VmRecord>, StoreError>;

    /// List every VM in a group regardless of state.
    async fn list_group(&self, group: &str) -> Result<Vec<VmRecord>, StoreError>;

    /// Find all VMs currently holding the given address. More than one hit
    /// means the provider reused the address while a stale record lingers.
    async fn lookup_by_ip(&self, ip: &str) -> Result<Vec<VmRecord>, StoreError>;

    /// Move a VM from `expected` to `next` only if it is still in
    /// `expected`. Returns whether the transition applied; a record that
    /// has since moved on (or disappeared) yields `Ok(false)`, never an
    /// error. Entering `Terminating` stamps `terminating_since`; entering
    /// `CheckHealth` stamps `last_health_check`.
    async fn set_state_guarded(
        &self,
        name: &str,
        expected: VmState,
        next: VmState,
    ) -> Result<bool, StoreError>;

    /// When the group's last spawn attempt started, if any.
    async fn last_spawn_attempt(&self, group: &str) -> Result<Option<i64>, StoreError>;

    /// Record the start of a spawn attempt for the group.
    async fn record_spawn_attempt(&self, group: &str, at: i64) -> Result<(), StoreError>;

    /// Record the controller's startup time.
    async fn mark_server_start(&self, at: i64) -> Result<(), StoreError>;

    /// Publish a message on a named channel.
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<(), StoreError>;
}
