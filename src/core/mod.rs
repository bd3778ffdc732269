//! Shared-memory primitives the simulation is built on.
//!
//! Nothing in here knows about ships or ports: regions, typed views, futex
//! waits and the per-shard lock.

pub mod error;
pub mod lock;
pub mod mmap;
pub mod region;
pub mod wait;

pub use error::{Error, Result};
pub use lock::{ShardGuard, ShardLock};
pub use region::{Region, RegionKey, Shared};
