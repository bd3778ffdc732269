//! Offer and demand ledger.
//!
//! Two dense `ports × goods` matrices of signed quantities, each living in its
//! own shared region. Every cell is an `AtomicI64`, so single-cell updates
//! never lose writes; operations that read and then write several cells of
//! one port (order allocation, merging, generation, sales) take that port's
//! shard lock. Different ports never contend.
//!
//! Cells may go negative when more is removed than present. That is a
//! defined, if degenerate, state: readers see the negative value, allocation
//! and generation treat such cells as empty.

mod generate;

use std::mem::size_of;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::core::region::align_for;
use crate::core::{Error, Region, RegionKey, Result, ShardGuard, ShardLock};
use crate::world::{RegionSlot, World};

pub use generate::Activity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Offer,
    Demand,
}

/// Per-good quantities detached from shared memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    quantities: Vec<i64>,
}

impl Manifest {
    pub fn new(goods: usize) -> Self {
        Self {
            quantities: vec![0; goods],
        }
    }

    pub fn from_quantities(quantities: Vec<i64>) -> Self {
        Self { quantities }
    }

    pub fn goods(&self) -> usize {
        self.quantities.len()
    }

    pub fn get(&self, good: usize) -> i64 {
        self.quantities.get(good).copied().unwrap_or(0)
    }

    pub fn add(&mut self, good: usize, quantity: i64) {
        if let Some(slot) = self.quantities.get_mut(good) {
            *slot += quantity;
        }
    }

    pub fn total(&self) -> i64 {
        self.quantities.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.quantities.iter().all(|&qty| qty == 0)
    }

    /// Non-zero entries in ascending good order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, i64)> + '_ {
        self.quantities
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, qty)| qty != 0)
    }
}

/// One `ports × goods` matrix in a shared region, with a lock word per port.
pub struct ShmMatrix {
    _region: Region,
    locks: *const AtomicU32,
    cells: *const AtomicI64,
    ports: usize,
    goods: usize,
}

// SAFETY: pointers target the mapping owned by `region`; all shared state is atomic.
unsafe impl Send for ShmMatrix {}
unsafe impl Sync for ShmMatrix {}

fn cells_offset(ports: usize) -> usize {
    align_for::<AtomicI64>(ports * size_of::<AtomicU32>())
}

impl ShmMatrix {
    pub fn create(root: &std::path::Path, key: RegionKey, ports: usize, goods: usize) -> Result<Self> {
        let len = cells_offset(ports) + ports * goods * size_of::<AtomicI64>();
        let region = Region::create(root, key, len)?;
        Self::from_region(region, ports, goods)
    }

    pub fn attach(root: &std::path::Path, key: RegionKey, ports: usize, goods: usize) -> Result<Self> {
        let region = Region::attach(root, key)?;
        Self::from_region(region, ports, goods)
    }

    fn from_region(region: Region, ports: usize, goods: usize) -> Result<Self> {
        let locks = region.view::<AtomicU32>(0, ports)?.as_ptr();
        let cells = region
            .view::<AtomicI64>(cells_offset(ports), ports * goods)?
            .as_ptr();
        Ok(Self {
            _region: region,
            locks,
            cells,
            ports,
            goods,
        })
    }

    fn check(&self, port: usize, good: usize) -> Result<usize> {
        if port >= self.ports || good >= self.goods {
            return Err(Error::InvalidArgument(format!(
                "cell ({port}, {good}) outside {}x{} ledger",
                self.ports, self.goods
            )));
        }
        Ok(port * self.goods + good)
    }

    /// Bounds-checked access to the `(port, good)` cell.
    pub fn cell(&self, port: usize, good: usize) -> Result<&AtomicI64> {
        let index = self.check(port, good)?;
        let cells = unsafe { std::slice::from_raw_parts(self.cells, self.ports * self.goods) };
        Ok(&cells[index])
    }

    pub fn lock_port(&self, port: usize) -> Result<ShardGuard<'_>> {
        self.check(port, 0)?;
        let locks = unsafe { std::slice::from_raw_parts(self.locks, self.ports) };
        Ok(ShardLock::new(&locks[port]).lock())
    }

    pub fn get(&self, port: usize, good: usize) -> Result<i64> {
        Ok(self.cell(port, good)?.load(Ordering::Acquire))
    }

    /// Adds `quantity` and returns the new value. Zero is a no-op.
    pub fn add(&self, port: usize, good: usize, quantity: i64) -> Result<i64> {
        let cell = self.cell(port, good)?;
        if quantity == 0 {
            return Ok(cell.load(Ordering::Acquire));
        }
        Ok(cell.fetch_add(quantity, Ordering::AcqRel) + quantity)
    }

    /// Subtracts `quantity` without clamping and returns the new value.
    pub fn remove(&self, port: usize, good: usize, quantity: i64) -> Result<i64> {
        let cell = self.cell(port, good)?;
        if quantity == 0 {
            return Ok(cell.load(Ordering::Acquire));
        }
        let value = cell.fetch_sub(quantity, Ordering::AcqRel) - quantity;
        if value < 0 {
            log::debug!("ledger cell ({port}, {good}) underflowed to {value}");
        }
        Ok(value)
    }

    pub fn row(&self, port: usize) -> Result<Manifest> {
        let mut row = Manifest::new(self.goods);
        for good in 0..self.goods {
            row.add(good, self.get(port, good)?);
        }
        Ok(row)
    }

    pub fn total(&self, port: usize) -> Result<i64> {
        Ok(self.row(port)?.total())
    }
}

pub struct Ledger {
    offers: ShmMatrix,
    demand: ShmMatrix,
}

impl Ledger {
    pub fn create(world: &World) -> Result<Self> {
        let (ports, goods) = (world.ports(), world.goods());
        Ok(Self {
            offers: ShmMatrix::create(world.root(), world.region_key(RegionSlot::Offers), ports, goods)?,
            demand: ShmMatrix::create(world.root(), world.region_key(RegionSlot::Demand), ports, goods)?,
        })
    }

    pub fn attach(world: &World) -> Result<Self> {
        let (ports, goods) = (world.ports(), world.goods());
        Ok(Self {
            offers: ShmMatrix::attach(world.root(), world.region_key(RegionSlot::Offers), ports, goods)?,
            demand: ShmMatrix::attach(world.root(), world.region_key(RegionSlot::Demand), ports, goods)?,
        })
    }

    pub fn ports(&self) -> usize {
        self.offers.ports
    }

    pub fn goods(&self) -> usize {
        self.offers.goods
    }

    pub fn matrix(&self, side: Side) -> &ShmMatrix {
        match side {
            Side::Offer => &self.offers,
            Side::Demand => &self.demand,
        }
    }

    pub fn add_offer(&self, port: usize, good: usize, quantity: i64) -> Result<i64> {
        self.offers.add(port, good, quantity)
    }

    pub fn remove_offer(&self, port: usize, good: usize, quantity: i64) -> Result<i64> {
        self.offers.remove(port, good, quantity)
    }

    pub fn add_demand(&self, port: usize, good: usize, quantity: i64) -> Result<i64> {
        self.demand.add(port, good, quantity)
    }

    pub fn remove_demand(&self, port: usize, good: usize, quantity: i64) -> Result<i64> {
        self.demand.remove(port, good, quantity)
    }

    pub fn quantity(&self, side: Side, port: usize, good: usize) -> Result<i64> {
        self.matrix(side).get(port, good)
    }

    pub fn offer(&self, port: usize, good: usize) -> Result<i64> {
        self.offers.get(port, good)
    }

    pub fn demand(&self, port: usize, good: usize) -> Result<i64> {
        self.demand.get(port, good)
    }

    /// Sum of the offer side of `port` across goods.
    pub fn total_quantity(&self, port: usize) -> Result<i64> {
        self.offers.total(port)
    }

    /// Folds a locally accumulated batch into the shared offers of `port`.
    pub fn merge_offers(&self, port: usize, batch: &Manifest) -> Result<()> {
        let _guard = self.offers.lock_port(port)?;
        for (good, quantity) in batch.iter() {
            self.offers.add(port, good, quantity)?;
        }
        Ok(())
    }

    /// Extracts up to `capacity` units from the offers of `port`, walking goods
    /// in ascending index order and draining each positive cell before moving
    /// on. The extracted quantities are removed from the ledger and returned.
    pub fn allocate_order(&self, port: usize, capacity: i64) -> Result<Manifest> {
        let mut order = Manifest::new(self.goods());
        if capacity <= 0 {
            return Ok(order);
        }
        let _guard = self.offers.lock_port(port)?;
        let mut allocated = 0;
        for good in 0..self.goods() {
            if allocated == capacity {
                break;
            }
            let cell = self.offers.cell(port, good)?;
            let available = cell.load(Ordering::Acquire);
            if available <= 0 {
                continue;
            }
            let take = available.min(capacity - allocated);
            cell.fetch_sub(take, Ordering::AcqRel);
            order.add(good, take);
            allocated += take;
        }
        Ok(order)
    }

    /// Accepts as much of a sale as the demand of `port` allows and debits it.
    /// Returns the accepted quantity, zero when nothing is wanted.
    pub fn settle_sale(&self, port: usize, good: usize, requested: i64) -> Result<i64> {
        let _guard = self.demand.lock_port(port)?;
        let wanted = self.demand.get(port, good)?;
        let accepted = requested.min(wanted);
        if accepted <= 0 {
            return Ok(0);
        }
        self.demand.remove(port, good, accepted)?;
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;

    pub(super) fn ledger(dir: &std::path::Path, ports: usize, goods: usize) -> (World, Ledger) {
        let config = WorldConfig {
            ports,
            goods,
            ..WorldConfig::default()
        };
        let world = World::create(dir, RegionKey(40), &config).expect("world");
        let ledger = Ledger::create(&world).expect("ledger");
        (world, ledger)
    }

    #[test]
    fn zero_quantity_updates_are_noops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_world, ledger) = ledger(dir.path(), 2, 2);
        assert_eq!(ledger.add_offer(1, 1, 0).unwrap(), 0);
        assert_eq!(ledger.add_demand(1, 1, 4).unwrap(), 4);
        assert_eq!(ledger.remove_demand(1, 1, 0).unwrap(), 4);
    }

    #[test]
    fn underflow_is_a_defined_negative_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_world, ledger) = ledger(dir.path(), 2, 2);
        ledger.add_offer(0, 1, 2).unwrap();
        assert_eq!(ledger.remove_offer(0, 1, 5).unwrap(), -3);
        assert_eq!(ledger.offer(0, 1).unwrap(), -3);
        // Negative cells are skipped by allocation.
        assert!(ledger.allocate_order(0, 10).unwrap().is_empty());
    }

    #[test]
    fn out_of_range_cells_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_world, ledger) = ledger(dir.path(), 2, 3);
        assert!(matches!(ledger.offer(2, 0), Err(Error::InvalidArgument(_))));
        assert!(matches!(ledger.add_demand(0, 3, 1), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn allocation_is_greedy_and_capped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_world, ledger) = ledger(dir.path(), 2, 4);
        ledger.add_offer(1, 0, 3).unwrap();
        ledger.add_offer(1, 2, 10).unwrap();
        ledger.add_offer(1, 3, 4).unwrap();
        let before = ledger.offers.row(1).unwrap();

        let order = ledger.allocate_order(1, 8).unwrap();
        assert_eq!(order.iter().collect::<Vec<_>>(), vec![(0, 3), (2, 5)]);
        assert_eq!(order.total(), 8);

        let after = ledger.offers.row(1).unwrap();
        for good in 0..4 {
            assert_eq!(after.get(good) + order.get(good), before.get(good));
        }
        // Other ports are untouched.
        assert_eq!(ledger.total_quantity(0).unwrap(), 0);
    }

    #[test]
    fn allocation_with_spare_capacity_drains_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_world, ledger) = ledger(dir.path(), 1, 3);
        ledger.add_offer(0, 1, 2).unwrap();
        ledger.add_offer(0, 2, 1).unwrap();
        let order = ledger.allocate_order(0, 100).unwrap();
        assert_eq!(order.total(), 3);
        assert_eq!(ledger.total_quantity(0).unwrap(), 0);
        assert!(ledger.allocate_order(0, 0).unwrap().is_empty());
    }

    #[test]
    fn merge_order_does_not_change_totals() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_world, ledger) = ledger(dir.path(), 2, 3);
        let a = Manifest::from_quantities(vec![1, 0, 4]);
        let b = Manifest::from_quantities(vec![0, 2, 1]);
        let c = Manifest::from_quantities(vec![3, 3, 0]);

        ledger.merge_offers(0, &a).unwrap();
        ledger.merge_offers(0, &b).unwrap();
        ledger.merge_offers(0, &c).unwrap();

        ledger.merge_offers(1, &b).unwrap();
        ledger.merge_offers(1, &c).unwrap();
        ledger.merge_offers(1, &a).unwrap();

        assert_eq!(ledger.offers.row(0).unwrap(), ledger.offers.row(1).unwrap());
        assert_eq!(ledger.total_quantity(0).unwrap(), 14);
    }

    #[test]
    fn settle_sale_caps_at_demand() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_world, ledger) = ledger(dir.path(), 1, 2);
        ledger.add_demand(0, 1, 3).unwrap();
        assert_eq!(ledger.settle_sale(0, 1, 5).unwrap(), 3);
        assert_eq!(ledger.demand(0, 1).unwrap(), 0);
        assert_eq!(ledger.settle_sale(0, 1, 5).unwrap(), 0);
    }

    #[test]
    fn attached_ledger_sees_updates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (world, ledger) = ledger(dir.path(), 2, 2);
        let other = Ledger::attach(&world).unwrap();
        ledger.add_demand(1, 0, 6).unwrap();
        assert_eq!(other.quantity(Side::Demand, 1, 0).unwrap(), 6);
    }
}
