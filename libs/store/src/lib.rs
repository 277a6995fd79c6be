//! # kiln-store
//!
//! VM descriptor model and the shared-store contract for the kiln build
//! fleet.
//!
//! ## Design Principles
//!
//! - The store is the single source of truth; the controller never holds a
//!   record exclusively.
//! - Reads are volatile snapshots. Every mutation that depends on a record's
//!   state goes through a state-guarded compare-and-set, so an action racing
//!   the asynchronous event handler degrades to a no-op.
//! - The contract offers per-record atomicity only, never multi-record
//!   transactions.

mod memory;
mod record;
mod store;

pub use memory::MemoryStore;
pub use record::{unix_now, VmRecord, VmState};
pub use store::{StoreError, VmStore};
