//! In-memory store implementation for tests and development.

use std::collections::HashMap;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

use crate::record::{unix_now, VmRecord, VmState};
use crate::store::{StoreError, VmStore};

use async_trait::async_trait;

/// Capacity of each pub/sub channel before slow subscribers lag.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct Inner {
    vms: HashMap<String, VmRecord>,
    last_spawn: HashMap<String, i64>,
    server_start: Option<i64>,
}

/// In-memory [`VmStore`].
///
/// Holds all descriptors behind one lock and backs pub/sub with broadcast
/// channels. Subscribers created via [`MemoryStore::subscribe`] receive
/// messages published after the subscription, which is what tests want.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    channels: Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a named channel.
    pub async fn subscribe(&self, channel: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// When the controller last started, if recorded.
    pub async fn server_start(&self) -> Option<i64> {
        self.inner.read().await.server_start
    }
}

#[async_trait]
impl VmStore for MemoryStore {
    async fn get_vm(&self, name: &str) -> Result<Option<VmRecord>, StoreError> {
        Ok(self.inner.read().await.vms.get(name).cloned())
    }

    async fn upsert_vm(&self, record: &VmRecord) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .vms
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn remove_vm(&self, name: &str) -> Result<(), StoreError> {
        self.inner.write().await.vms.remove(name);
        Ok(())
    }

    async fn list_vms(
        &self,
        group: Option<&str>,
        states: &[VmState],
    ) -> Result<Vec<VmRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut records: Vec<VmRecord> = inner
            .vms
            .values()
            .filter(|v| group.is_none_or(|g| v.group == g))
            .filter(|v| states.contains(&v.state))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn list_group(&self, group: &str) -> Result<Vec<VmRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut records: Vec<VmRecord> = inner
            .vms
            .values()
            .filter(|v| v.group == group)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn lookup_by_ip(&self, ip: &str) -> Result<Vec<VmRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .vms
            .values()
            .filter(|v| v.ip.as_deref() == Some(ip))
            .cloned()
            .collect())
    }

    async fn set_state_guarded(
        &self,
        name: &str,
        expected: VmState,
        next: VmState,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.vms.get_mut(name) else {
            return Ok(false);
        };
        if record.state != expected {
            debug!(
                vm = %name,
                expected = %expected,
                current = %record.state,
                "guarded transition skipped, record moved on"
            );
            return Ok(false);
        }
        record.state = next;
        match next {
            VmState::Terminating => record.terminating_since = Some(unix_now()),
            VmState::CheckHealth => record.last_health_check = Some(unix_now()),
            _ => {}
        }
        Ok(true)
    }

    async fn last_spawn_attempt(&self, group: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.inner.read().await.last_spawn.get(group).copied())
    }

    async fn record_spawn_attempt(&self, group: &str, at: i64) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .last_spawn
            .insert(group.to_string(), at);
        Ok(())
    }

    async fn mark_server_start(&self, at: i64) -> Result<(), StoreError> {
        self.inner.write().await.server_start = Some(at);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<(), StoreError> {
        let channels = self.channels.lock().await;
        if let Some(sender) = channels.get(channel) {
            // A send error just means nobody is listening.
            let _ = sender.send(payload);
        }
        Ok(())
    }
}
