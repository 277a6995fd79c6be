//! kiln Fleet Daemon Library
//!
//! `fleetd` keeps a pool of disposable build-executor VMs healthy and
//! correctly sized. A cyclic controller audits every VM record each tick,
//! spawning, health-checking and reclaiming through narrow collaborator
//! contracts, while an asynchronous event handler advances records from
//! provider callbacks. A companion dispatcher pulls work items from a remote
//! authority and feeds a bounded worker manager.
//!
//! ## Modules
//!
//! - `controller`: the fleet control loop and its per-cycle audits
//! - `dispatcher`: the task-dispatch loop
//! - `provision`: spawner/terminator/checker contracts and mocks
//! - `events`: the asynchronous event-handler seam
//! - `process`: builder-process liveness probing
//! - `config`: thresholds and per-group limits

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod events;
pub mod process;
pub mod provision;

// Re-export commonly used types
pub use config::{Config, GroupLimits, Thresholds};
pub use controller::{FleetController, RESCHEDULE_CHANNEL};
pub use dispatcher::{Dispatcher, Task};
