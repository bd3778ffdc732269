//! Hazard delivery.
//!
//! Hazards are out-of-band notifications addressed to one agent. Instead of
//! preempting the agent, the sender sets a bit in the target's inbox word and
//! wakes it; the agent drains the inbox at its own checkpoints. Like POSIX
//! signals, repeated deliveries of one kind before the agent looks collapse
//! into one. While the inbox is masked, [`HazardInbox::take`] reports nothing
//! and deliveries stay pending until unmasked.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::core::region::Shared;
use crate::core::wait::{futex_wait, futex_wake};
use crate::core::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hazard {
    /// Forced downtime for a ship.
    Storm,
    /// Sinks a ship.
    Maelstrom,
    /// Closes a port's docks for a while.
    Swell,
    /// Orderly shutdown request.
    Terminate,
    /// The agent hit an unrecoverable fault.
    Fault,
}

impl Hazard {
    // Lower bits are drained first: fatal hazards win over storms.
    const ORDER: [Hazard; 5] = [
        Hazard::Fault,
        Hazard::Maelstrom,
        Hazard::Terminate,
        Hazard::Swell,
        Hazard::Storm,
    ];

    fn bit(self) -> u32 {
        match self {
            Hazard::Fault => 1 << 0,
            Hazard::Maelstrom => 1 << 1,
            Hazard::Terminate => 1 << 2,
            Hazard::Swell => 1 << 3,
            Hazard::Storm => 1 << 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Hazard::Storm => "storm",
            Hazard::Maelstrom => "maelstrom",
            Hazard::Swell => "swell",
            Hazard::Terminate => "terminate",
            Hazard::Fault => "fault",
        }
    }
}

impl fmt::Display for Hazard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pending-hazard word plus mask flag, embedded in ship and port records.
#[repr(C)]
#[derive(Default)]
pub struct HazardInbox {
    pending: AtomicU32,
    masked: AtomicU32,
    /// Bumped on every delivery; agents sleep on it.
    seq: AtomicU32,
    delivered: AtomicU32,
}

unsafe impl Shared for HazardInbox {}

impl HazardInbox {
    /// Fire-and-forget delivery.
    pub fn deliver(&self, hazard: Hazard) -> Result<()> {
        self.pending.fetch_or(hazard.bit(), Ordering::AcqRel);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake(&self.seq)
    }

    /// Removes and returns the most severe pending hazard, unless masked.
    pub fn take(&self) -> Option<Hazard> {
        if self.is_masked() {
            return None;
        }
        let pending = self.pending.load(Ordering::Acquire);
        for hazard in Hazard::ORDER {
            if pending & hazard.bit() != 0 {
                let prev = self.pending.fetch_and(!hazard.bit(), Ordering::AcqRel);
                if prev & hazard.bit() != 0 {
                    return Some(hazard);
                }
            }
        }
        None
    }

    pub fn is_pending(&self, hazard: Hazard) -> bool {
        self.pending.load(Ordering::Acquire) & hazard.bit() != 0
    }

    pub fn mask(&self) -> HazardMask<'_> {
        self.masked.fetch_add(1, Ordering::AcqRel);
        HazardMask { inbox: self }
    }

    pub fn is_masked(&self) -> bool {
        self.masked.load(Ordering::Acquire) != 0
    }

    pub fn delivered(&self) -> u32 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Sleeps until something is delivered or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let seq = self.seq.load(Ordering::Acquire);
        if self.pending.load(Ordering::Acquire) != 0 && !self.is_masked() {
            return Ok(());
        }
        futex_wait(&self.seq, seq, Some(timeout))
    }

    /// Clears pending and mask state when a record is (re)initialised.
    pub fn reset(&self) {
        self.pending.store(0, Ordering::Release);
        self.masked.store(0, Ordering::Release);
    }
}

/// Keeps an inbox masked for its lifetime. Masks nest.
pub struct HazardMask<'a> {
    inbox: &'a HazardInbox,
}

impl Drop for HazardMask<'_> {
    fn drop(&mut self) {
        self.inbox.masked.fetch_sub(1, Ordering::AcqRel);
    }
}
