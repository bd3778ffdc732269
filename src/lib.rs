//! Maritime trade simulation over shared memory.
//!
//! Ships, ports, a weather generator and a day clock run as independent
//! agents (processes or threads) that coordinate only through file-backed
//! shared regions: an offer/demand ledger sharded by port, ship and port
//! records with hazard inboxes and dock semaphores, and commerce mailboxes.

pub mod agent;
pub mod catalog;
pub mod commerce;
pub mod config;
pub mod context;
pub mod core;
pub mod dock;
pub mod hazard;
pub mod hold;
pub mod ledger;
pub mod records;
pub mod report;
pub mod sim;
pub mod world;

pub use crate::config::WorldConfig;
pub use crate::context::Context;
pub use crate::core::{Error, RegionKey, Result};
pub use crate::ledger::{Ledger, Manifest};
pub use crate::report::Report;
pub use crate::sim::Simulation;
pub use crate::world::{World, DEFAULT_WORLD_KEY};
