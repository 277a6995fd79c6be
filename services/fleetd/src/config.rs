//! Configuration for the fleet daemon.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};

/// Fleet-wide timing thresholds.
#[derive(Debug, Clone)]
pub struct Thresholds {
    /// Interval between fleet cycles.
    pub cycle_interval: Duration,

    /// How often each VM gets a health check.
    pub health_check_period: Duration,

    /// How long a VM may sit in `CheckHealth` before it is failed. Covers
    /// lost callbacks and controller crashes mid-check.
    pub health_check_max_duration: Duration,

    /// How long a termination request may go unconfirmed before retry.
    pub terminating_timeout: Duration,

    /// Grace window after acquisition before the owning builder process is
    /// audited. Gives the worker time to register its identity.
    pub dead_builder_grace: Duration,

    /// Fail-safe cap: no group may hold more than this multiple of its
    /// `max_vm_total`, counting every state. Guards against the active-count
    /// estimator under-counting on store inconsistency.
    pub failsafe_multiplier: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cycle_interval: Duration::from_secs(10),
            health_check_period: Duration::from_secs(120),
            health_check_max_duration: Duration::from_secs(300),
            terminating_timeout: Duration::from_secs(600),
            dead_builder_grace: Duration::from_secs(60),
            failsafe_multiplier: 2,
        }
    }
}

/// Capacity and rate limits for one build group.
#[derive(Debug, Clone)]
pub struct GroupLimits {
    /// Ceiling on active VMs plus in-flight spawn attempts.
    pub max_vm_total: usize,

    /// Ceiling on concurrent spawn attempts.
    pub max_spawn_processes: usize,

    /// Minimum time between spawn-attempt starts.
    pub spawn_min_interval: Duration,

    /// How long a released, user-bound VM may wait unclaimed before it is
    /// reclaimed.
    pub dirty_vm_timeout: Duration,
}

impl Default for GroupLimits {
    fn default() -> Self {
        Self {
            max_vm_total: 16,
            max_spawn_processes: 4,
            spawn_min_interval: Duration::from_secs(30),
            dirty_vm_timeout: Duration::from_secs(300),
        }
    }
}

/// Fleet daemon configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub thresholds: Thresholds,

    /// Limits per build group, keyed by group name.
    pub groups: HashMap<String, GroupLimits>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `KILN_GROUPS` is a comma-separated list of group names; every group
    /// shares the limits given by the `KILN_MAX_VM_TOTAL`,
    /// `KILN_MAX_SPAWN_PROCESSES`, `KILN_SPAWN_MIN_INTERVAL` and
    /// `KILN_DIRTY_VM_TIMEOUT` variables.
    pub fn from_env() -> Result<Self> {
        let mut thresholds = Thresholds::default();
        if let Some(secs) = env_u64("KILN_CYCLE_INTERVAL") {
            thresholds.cycle_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("KILN_HEALTH_CHECK_PERIOD") {
            thresholds.health_check_period = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("KILN_HEALTH_CHECK_MAX_DURATION") {
            thresholds.health_check_max_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("KILN_TERMINATING_TIMEOUT") {
            thresholds.terminating_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("KILN_DEAD_BUILDER_GRACE") {
            thresholds.dead_builder_grace = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("KILN_FAILSAFE_MULTIPLIER") {
            thresholds.failsafe_multiplier = n as u32;
        }

        let mut limits = GroupLimits::default();
        if let Some(n) = env_u64("KILN_MAX_VM_TOTAL") {
            limits.max_vm_total = n as usize;
        }
        if let Some(n) = env_u64("KILN_MAX_SPAWN_PROCESSES") {
            limits.max_spawn_processes = n as usize;
        }
        if let Some(secs) = env_u64("KILN_SPAWN_MIN_INTERVAL") {
            limits.spawn_min_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("KILN_DIRTY_VM_TIMEOUT") {
            limits.dirty_vm_timeout = Duration::from_secs(secs);
        }

        let group_names =
            std::env::var("KILN_GROUPS").unwrap_or_else(|_| "default".to_string());
        let groups = group_names
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(|g| (g.to_string(), limits.clone()))
            .collect();

        let log_level = std::env::var("KILN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let config = Self {
            thresholds,
            groups,
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the controller must not start with.
    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            bail!("no build groups configured");
        }
        if self.thresholds.cycle_interval.is_zero() {
            bail!("cycle interval must be non-zero");
        }
        if self.thresholds.failsafe_multiplier < 1 {
            bail!("fail-safe multiplier must be at least 1");
        }
        for (name, limits) in &self.groups {
            if limits.max_vm_total == 0 {
                bail!("group {name}: max_vm_total must be non-zero");
            }
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_group() -> Config {
        let mut config = Config {
            log_level: "info".to_string(),
            ..Config::default()
        };
        config
            .groups
            .insert("x86_64".to_string(), GroupLimits::default());
        config
    }

    #[test]
    fn default_thresholds() {
        let thresholds = Thresholds::default();
        assert_eq!(thresholds.cycle_interval, Duration::from_secs(10));
        assert_eq!(thresholds.dead_builder_grace, Duration::from_secs(60));
        assert_eq!(thresholds.failsafe_multiplier, 2);
    }

    #[test]
    fn validate_accepts_sane_config() {
        assert!(config_with_group().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_groups() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_cycle_interval() {
        let mut config = config_with_group();
        config.thresholds.cycle_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_capacity_group() {
        let mut config = config_with_group();
        config.groups.get_mut("x86_64").unwrap().max_vm_total = 0;
        assert!(config.validate().is_err());
    }
}
