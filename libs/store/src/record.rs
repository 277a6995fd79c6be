//! VM descriptor records and the lifecycle state enumeration.
//!
//! A [`VmRecord`] is the persisted state of one managed build VM, keyed by
//! its unique name. Records are created by the spawner collaborator when
//! provisioning begins and removed only by the fleet controller.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// VM lifecycle state.
///
/// Ordered roughly by lifecycle: a freshly registered VM is `Spawning`
/// until the provider reports an address, then walks `GotIp` →
/// `CheckHealth` → `Ready` ⇄ `InUse`. `CheckHealthFailed` is not terminal;
/// it is re-checked on the same cadence as `Ready`. Any non-terminal state
/// can move to `Terminating`, after which the record is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// Provisioning started, no address yet.
    Spawning,
    /// Provider reported an address.
    GotIp,
    /// A health check is in flight.
    CheckHealth,
    /// The last health check failed; will be retried.
    CheckHealthFailed,
    /// Healthy and available for acquisition.
    Ready,
    /// Acquired by a builder process.
    InUse,
    /// Teardown requested.
    Terminating,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::GotIp => "got_ip",
            Self::CheckHealth => "check_health",
            Self::CheckHealthFailed => "check_health_failed",
            Self::Ready => "ready",
            Self::InUse => "in_use",
            Self::Terminating => "terminating",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "spawning" => Some(Self::Spawning),
            "got_ip" => Some(Self::GotIp),
            "check_health" => Some(Self::CheckHealth),
            "check_health_failed" => Some(Self::CheckHealthFailed),
            "ready" => Some(Self::Ready),
            "in_use" => Some(Self::InUse),
            "terminating" => Some(Self::Terminating),
            _ => None,
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One managed VM's descriptor.
///
/// All timestamps are wall-clock unix seconds. Fields other than `name`,
/// `group` and `state` are filled in as the VM moves through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    /// Unique VM name.
    pub name: String,

    /// Build-environment class this VM belongs to.
    pub group: String,

    /// Network address, absent pre-provisioning.
    pub ip: Option<String>,

    /// Current lifecycle state.
    pub state: VmState,

    /// Requester this VM is reserved for after release, if any.
    pub bound_to_user: Option<String>,

    /// When the VM was last released back to the pool.
    pub last_release: Option<i64>,

    /// When the VM was acquired by a builder.
    pub in_use_since: Option<i64>,

    /// Pid of the builder process that acquired the VM.
    pub used_by_pid: Option<u32>,

    /// When a health check last ran (or was last requested).
    pub last_health_check: Option<i64>,

    /// When termination was last requested.
    pub terminating_since: Option<i64>,

    /// Build the VM was last working on, for reschedule notifications.
    pub build_id: Option<String>,

    /// Task the VM was last working on, for reschedule notifications.
    pub task_id: Option<String>,

    /// Chroot of the work item, for reschedule notifications.
    pub chroot: Option<String>,
}

impl VmRecord {
    /// Create a fresh descriptor in the `Spawning` state.
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            ip: None,
            state: VmState::Spawning,
            bound_to_user: None,
            last_release: None,
            in_use_since: None,
            used_by_pid: None,
            last_health_check: None,
            terminating_since: None,
            build_id: None,
            task_id: None,
            chroot: None,
        }
    }
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(VmState::Spawning)]
    #[case(VmState::GotIp)]
    #[case(VmState::CheckHealth)]
    #[case(VmState::CheckHealthFailed)]
    #[case(VmState::Ready)]
    #[case(VmState::InUse)]
    #[case(VmState::Terminating)]
    fn state_string_roundtrip(#[case] state: VmState) {
        assert_eq!(VmState::parse(state.as_str()), Some(state));
    }

    #[test]
    fn state_parse_rejects_unknown() {
        assert_eq!(VmState::parse("galloping"), None);
    }

    #[test]
    fn record_serializes_state_as_snake_case() {
        let record = VmRecord::new("builder-7", "x86_64");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"state\":\"spawning\""));
    }
}
