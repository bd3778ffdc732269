use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::{Coord, SharedCoord};
use crate::core::region::Shared;
use crate::core::{Error, Region, Result};
use crate::hazard::HazardInbox;
use crate::world::{RegionSlot, World};

const NO_PORT: u32 = u32::MAX;
/// Set on an open exchange once a port has taken it on.
const CLAIMED: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipFlag {
    Moving = 1 << 0,
    Dead = 1 << 1,
    AtDock = 1 << 2,
    WithCargo = 1 << 3,
}

/// Written only by the owning ship agent; read by everyone else.
#[repr(C, align(64))]
pub struct ShipRecord {
    pid: AtomicU32,
    flags: AtomicU32,
    port: AtomicU32,
    storms: AtomicU32,
    maelstroms: AtomicU32,
    _pad0: AtomicU32,
    /// Exchange the ship is waiting on, 0 when none.
    exchange: AtomicU64,
    position: SharedCoord,
    inbox: HazardInbox,
}

unsafe impl Shared for ShipRecord {}

impl ShipRecord {
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn flag(&self, flag: ShipFlag) -> bool {
        self.flags.load(Ordering::Acquire) & flag as u32 != 0
    }

    pub fn set_flag(&self, flag: ShipFlag, on: bool) {
        if on {
            self.flags.fetch_or(flag as u32, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!(flag as u32), Ordering::AcqRel);
        }
    }

    pub fn is_dead(&self) -> bool {
        self.flag(ShipFlag::Dead)
    }

    pub fn position(&self) -> Coord {
        self.position.load()
    }

    pub fn set_position(&self, coord: Coord) {
        self.position.store(coord);
    }

    /// Port the ship is heading to or docked at.
    pub fn port(&self) -> Option<usize> {
        match self.port.load(Ordering::Acquire) {
            NO_PORT => None,
            port => Some(port as usize),
        }
    }

    pub fn set_port(&self, port: Option<usize>) {
        let raw = port.map_or(NO_PORT, |port| port as u32);
        self.port.store(raw, Ordering::Release);
    }

    pub fn record_storm(&self) {
        self.storms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn storms(&self) -> u32 {
        self.storms.load(Ordering::Relaxed)
    }

    pub fn record_maelstrom(&self) {
        self.maelstroms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn maelstroms(&self) -> u32 {
        self.maelstroms.load(Ordering::Relaxed)
    }

    pub fn inbox(&self) -> &HazardInbox {
        &self.inbox
    }

    /// Publishes `exchange` as the one request the ship is waiting on.
    pub fn open_exchange(&self, exchange: u64) {
        self.exchange.store(exchange, Ordering::Release);
    }

    pub fn close_exchange(&self) {
        self.exchange.store(0, Ordering::Release);
    }

    /// Port side: takes on `exchange` so the ship will wait for its replies.
    /// Fails when the ship is no longer waiting on it.
    pub fn claim_exchange(&self, exchange: u64) -> bool {
        exchange != 0
            && self
                .exchange
                .compare_exchange(exchange, exchange | CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Ship side: withdraws `exchange` unless a port already claimed it.
    pub fn withdraw_exchange(&self, exchange: u64) -> bool {
        self.exchange
            .compare_exchange(exchange, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn reset(&self) {
        self.pid.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.port.store(NO_PORT, Ordering::Relaxed);
        self.storms.store(0, Ordering::Relaxed);
        self.maelstroms.store(0, Ordering::Relaxed);
        self.exchange.store(0, Ordering::Relaxed);
        self.inbox.reset();
    }
}

pub struct ShipTable {
    _region: Region,
    records: *const ShipRecord,
    len: usize,
}

// SAFETY: the pointer targets the mapping owned by `_region`; records are atomic.
unsafe impl Send for ShipTable {}
unsafe impl Sync for ShipTable {}

impl ShipTable {
    pub fn create(world: &World) -> Result<Self> {
        let len = world.ships();
        let region = Region::create(
            world.root(),
            world.region_key(RegionSlot::Ships),
            len * size_of::<ShipRecord>(),
        )?;
        let table = Self::from_region(region, len)?;
        for record in table.records() {
            record.reset();
        }
        Ok(table)
    }

    pub fn attach(world: &World) -> Result<Self> {
        let region = Region::attach(world.root(), world.region_key(RegionSlot::Ships))?;
        Self::from_region(region, world.ships())
    }

    fn from_region(region: Region, len: usize) -> Result<Self> {
        let records = region.view::<ShipRecord>(0, len)?.as_ptr();
        Ok(Self {
            _region: region,
            records,
            len,
        })
    }

    pub fn records(&self) -> &[ShipRecord] {
        unsafe { std::slice::from_raw_parts(self.records, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, id: usize) -> Result<&ShipRecord> {
        self.records()
            .get(id)
            .ok_or_else(|| Error::InvalidArgument(format!("no ship {id}")))
    }

    pub fn live_ids(&self) -> Vec<usize> {
        self.records()
            .iter()
            .enumerate()
            .filter(|(_, record)| !record.is_dead())
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::core::RegionKey;

    #[test]
    fn records_are_shared_between_attachments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = WorldConfig {
            ships: 3,
            ..WorldConfig::default()
        };
        let world = World::create(dir.path(), RegionKey(60), &config).expect("world");
        let owner = ShipTable::create(&world).expect("create");
        let observer = ShipTable::attach(&world).expect("attach");

        let ship = owner.get(1).unwrap();
        ship.set_position(Coord::new(3.5, 4.0));
        ship.set_flag(ShipFlag::Moving, true);
        ship.set_flag(ShipFlag::WithCargo, true);
        ship.set_flag(ShipFlag::Moving, false);
        ship.set_port(Some(2));

        let seen = observer.get(1).unwrap();
        assert_eq!(seen.position(), Coord::new(3.5, 4.0));
        assert!(!seen.flag(ShipFlag::Moving));
        assert!(seen.flag(ShipFlag::WithCargo));
        assert_eq!(seen.port(), Some(2));
        assert_eq!(observer.get(0).unwrap().port(), None);

        owner.get(0).unwrap().set_flag(ShipFlag::Dead, true);
        assert_eq!(observer.live_ids(), vec![1, 2]);
        assert!(observer.get(3).is_err());
    }

    #[test]
    fn an_exchange_is_either_claimed_or_withdrawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let world = World::create(dir.path(), RegionKey(61), &WorldConfig::default()).expect("world");
        let table = ShipTable::create(&world).expect("create");
        let ship = table.get(0).unwrap();

        assert!(!ship.claim_exchange(0));
        ship.open_exchange(5);
        assert!(!ship.claim_exchange(4));
        assert!(ship.claim_exchange(5));
        assert!(!ship.claim_exchange(5));
        assert!(!ship.withdraw_exchange(5));

        ship.open_exchange(6);
        assert!(ship.withdraw_exchange(6));
        assert!(!ship.claim_exchange(6));
        ship.close_exchange();
        assert!(!ship.withdraw_exchange(6));
    }
}
