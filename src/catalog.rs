//! Per-good unit size and shelf life, plus the telemetry counters the rest of
//! the simulation bumps for reporting. Counters never feed back into any
//! decision.

use std::mem::size_of;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use rand::Rng;
use serde::Serialize;

use crate::core::region::{align_for, Shared};
use crate::core::{Error, Region, Result};
use crate::world::{RegionSlot, World};

#[repr(C, align(64))]
pub struct GoodRecord {
    pub size: AtomicI64,
    pub life: AtomicU32,
    pub _pad0: AtomicU32,
    pub generated: AtomicI64,
    pub delivered: AtomicI64,
    pub expired_port: AtomicI64,
    pub expired_ship: AtomicI64,
}

unsafe impl Shared for GoodRecord {}

#[repr(C)]
pub struct PortTally {
    pub offered: AtomicI64,
    pub demanded: AtomicI64,
}

unsafe impl Shared for PortTally {}

/// Static description of one good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoodSpec {
    pub size: i64,
    pub life: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GoodStats {
    pub generated: i64,
    pub delivered: i64,
    pub expired_port: i64,
    pub expired_ship: i64,
}

pub struct Catalog {
    _region: Region,
    goods: *const GoodRecord,
    tallies: *const PortTally,
    n_goods: usize,
    n_ports: usize,
}

// SAFETY: both pointers target the mapping owned by `_region`; all fields are atomic.
unsafe impl Send for Catalog {}
unsafe impl Sync for Catalog {}

fn tally_offset(goods: usize) -> usize {
    align_for::<PortTally>(goods * size_of::<GoodRecord>())
}

impl Catalog {
    /// Rolls unit sizes and shelf lives from the world's configured bounds.
    pub fn create<R: Rng>(world: &World, rng: &mut R) -> Result<Self> {
        let config = world.config();
        let specs: Vec<GoodSpec> = (0..config.goods)
            .map(|_| GoodSpec {
                size: rng.gen_range(config.min_size..=config.max_size),
                life: rng.gen_range(config.min_life..=config.max_life),
            })
            .collect();
        Self::create_with(world, &specs)
    }

    pub fn create_with(world: &World, specs: &[GoodSpec]) -> Result<Self> {
        if specs.len() != world.goods() {
            return Err(Error::InvalidArgument(format!(
                "catalog needs {} goods, got {}",
                world.goods(),
                specs.len()
            )));
        }
        if specs.iter().any(|spec| spec.size < 1) {
            return Err(Error::InvalidArgument("unit size must be at least 1".into()));
        }
        let n_goods = world.goods();
        let n_ports = world.ports();
        let len = tally_offset(n_goods) + n_goods * n_ports * size_of::<PortTally>();
        let region = Region::create(world.root(), world.region_key(RegionSlot::Catalog), len)?;
        let catalog = Self::from_region(region, n_goods, n_ports)?;
        for (record, spec) in catalog.records().iter().zip(specs) {
            record.size.store(spec.size, Ordering::Release);
            record.life.store(spec.life, Ordering::Release);
        }
        Ok(catalog)
    }

    pub fn attach(world: &World) -> Result<Self> {
        let region = Region::attach(world.root(), world.region_key(RegionSlot::Catalog))?;
        Self::from_region(region, world.goods(), world.ports())
    }

    fn from_region(region: Region, n_goods: usize, n_ports: usize) -> Result<Self> {
        let goods = region.view::<GoodRecord>(0, n_goods)?.as_ptr();
        let tallies = region
            .view::<PortTally>(tally_offset(n_goods), n_goods * n_ports)?
            .as_ptr();
        Ok(Self {
            _region: region,
            goods,
            tallies,
            n_goods,
            n_ports,
        })
    }

    fn records(&self) -> &[GoodRecord] {
        unsafe { std::slice::from_raw_parts(self.goods, self.n_goods) }
    }

    fn tally(&self, good: usize, port: usize) -> &PortTally {
        debug_assert!(good < self.n_goods && port < self.n_ports);
        let tallies = unsafe { std::slice::from_raw_parts(self.tallies, self.n_goods * self.n_ports) };
        &tallies[good * self.n_ports + port]
    }

    pub fn goods(&self) -> usize {
        self.n_goods
    }

    pub fn size(&self, good: usize) -> i64 {
        self.records()[good].size.load(Ordering::Acquire)
    }

    pub fn life(&self, good: usize) -> u32 {
        self.records()[good].life.load(Ordering::Acquire)
    }

    pub fn spec(&self, good: usize) -> GoodSpec {
        GoodSpec {
            size: self.size(good),
            life: self.life(good),
        }
    }

    /// Good with the smallest unit size; lowest index wins ties.
    pub fn min_size_good(&self) -> usize {
        (0..self.n_goods)
            .min_by_key(|&good| (self.size(good), good))
            .unwrap_or(0)
    }

    pub fn record_generated(&self, good: usize, quantity: i64) {
        self.records()[good]
            .generated
            .fetch_add(quantity, Ordering::Relaxed);
    }

    pub fn record_offer(&self, good: usize, port: usize, quantity: i64) {
        self.tally(good, port)
            .offered
            .fetch_add(quantity, Ordering::Relaxed);
    }

    pub fn record_demand(&self, good: usize, port: usize, quantity: i64) {
        self.tally(good, port)
            .demanded
            .fetch_add(quantity, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, good: usize, quantity: i64) {
        self.records()[good]
            .delivered
            .fetch_add(quantity, Ordering::Relaxed);
    }

    pub fn record_expired_port(&self, good: usize, quantity: i64) {
        self.records()[good]
            .expired_port
            .fetch_add(quantity, Ordering::Relaxed);
    }

    pub fn record_expired_ship(&self, good: usize, quantity: i64) {
        self.records()[good]
            .expired_ship
            .fetch_add(quantity, Ordering::Relaxed);
    }

    pub fn stats(&self, good: usize) -> GoodStats {
        let record = &self.records()[good];
        GoodStats {
            generated: record.generated.load(Ordering::Relaxed),
            delivered: record.delivered.load(Ordering::Relaxed),
            expired_port: record.expired_port.load(Ordering::Relaxed),
            expired_ship: record.expired_ship.load(Ordering::Relaxed),
        }
    }

    /// Port that has offered the most of `good` so far, if any offered at all.
    pub fn port_with_max_offer(&self, good: usize) -> Option<(usize, i64)> {
        self.max_by(good, |tally| tally.offered.load(Ordering::Relaxed))
    }

    pub fn port_with_max_demand(&self, good: usize) -> Option<(usize, i64)> {
        self.max_by(good, |tally| tally.demanded.load(Ordering::Relaxed))
    }

    fn max_by(&self, good: usize, value: impl Fn(&PortTally) -> i64) -> Option<(usize, i64)> {
        (0..self.n_ports)
            .map(|port| (port, value(self.tally(good, port))))
            .filter(|&(_, qty)| qty > 0)
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
    }
}
