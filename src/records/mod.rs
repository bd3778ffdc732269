//! Shared per-ship and per-port records.

mod port;
mod ship;

use std::sync::atomic::{AtomicU64, Ordering};

pub use port::{place_ports, PortRecord, PortTable};
pub use ship::{ShipFlag, ShipRecord, ShipTable};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Coord) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// A coordinate pair stored as `f64` bit patterns.
#[repr(C)]
pub struct SharedCoord {
    x: AtomicU64,
    y: AtomicU64,
}

impl SharedCoord {
    pub fn load(&self) -> Coord {
        Coord {
            x: f64::from_bits(self.x.load(Ordering::Acquire)),
            y: f64::from_bits(self.y.load(Ordering::Acquire)),
        }
    }

    pub fn store(&self, coord: Coord) {
        self.x.store(coord.x.to_bits(), Ordering::Release);
        self.y.store(coord.y.to_bits(), Ordering::Release);
    }
}
