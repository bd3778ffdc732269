use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;

use super::{Coord, SharedCoord};
use crate::core::region::Shared;
use crate::core::{Error, Region, Result};
use crate::dock::DockSemaphore;
use crate::hazard::HazardInbox;
use crate::world::{RegionSlot, World};

#[repr(C, align(64))]
pub struct PortRecord {
    pid: AtomicU32,
    swells: AtomicU32,
    position: SharedCoord,
    inbox: HazardInbox,
    dock: DockSemaphore,
}

unsafe impl Shared for PortRecord {}

impl PortRecord {
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::Release);
    }

    pub fn position(&self) -> Coord {
        self.position.load()
    }

    pub fn inbox(&self) -> &HazardInbox {
        &self.inbox
    }

    pub fn dock(&self) -> &DockSemaphore {
        &self.dock
    }

    pub fn record_swell(&self) {
        self.swells.fetch_add(1, Ordering::Relaxed);
    }

    pub fn swells(&self) -> u32 {
        self.swells.load(Ordering::Relaxed)
    }
}

pub struct PortTable {
    _region: Region,
    records: *const PortRecord,
    len: usize,
}

// SAFETY: the pointer targets the mapping owned by `_region`; records are atomic.
unsafe impl Send for PortTable {}
unsafe impl Sync for PortTable {}

/// Places the first four ports at the map corners and the rest at random.
pub fn place_ports<R: Rng>(count: usize, side: f64, rng: &mut R) -> Vec<Coord> {
    let corners = [
        Coord::new(0.0, 0.0),
        Coord::new(side, 0.0),
        Coord::new(side, side),
        Coord::new(0.0, side),
    ];
    (0..count)
        .map(|i| match corners.get(i) {
            Some(corner) => *corner,
            None => Coord::new(rng.gen_range(0.0..=side), rng.gen_range(0.0..=side)),
        })
        .collect()
}

impl PortTable {
    pub fn create(world: &World, positions: &[Coord]) -> Result<Self> {
        let len = world.ports();
        if positions.len() != len {
            return Err(Error::InvalidArgument(format!(
                "need {len} port positions, got {}",
                positions.len()
            )));
        }
        let region = Region::create(
            world.root(),
            world.region_key(RegionSlot::Ports),
            len * size_of::<PortRecord>(),
        )?;
        let table = Self::from_region(region, len)?;
        for (record, position) in table.records().iter().zip(positions) {
            record.position.store(*position);
            record.inbox.reset();
            record.dock.init(world.config().docks);
        }
        Ok(table)
    }

    pub fn attach(world: &World) -> Result<Self> {
        let region = Region::attach(world.root(), world.region_key(RegionSlot::Ports))?;
        Self::from_region(region, world.ports())
    }

    fn from_region(region: Region, len: usize) -> Result<Self> {
        let records = region.view::<PortRecord>(0, len)?.as_ptr();
        Ok(Self {
            _region: region,
            records,
            len,
        })
    }

    pub fn records(&self) -> &[PortRecord] {
        unsafe { std::slice::from_raw_parts(self.records, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, id: usize) -> Result<&PortRecord> {
        self.records()
            .get(id)
            .ok_or_else(|| Error::InvalidArgument(format!("no port {id}")))
    }

    pub fn position(&self, id: usize) -> Result<Coord> {
        Ok(self.get(id)?.position())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::core::RegionKey;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn corners_first_then_random_inside_map() {
        let mut rng = StdRng::seed_from_u64(2);
        let spots = place_ports(6, 50.0, &mut rng);
        assert_eq!(spots[2], Coord::new(50.0, 50.0));
        for spot in &spots[4..] {
            assert!((0.0..=50.0).contains(&spot.x) && (0.0..=50.0).contains(&spot.y));
        }
    }

    #[test]
    fn docks_start_at_configured_capacity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = WorldConfig {
            ports: 2,
            docks: 3,
            ..WorldConfig::default()
        };
        let world = World::create(dir.path(), RegionKey(70), &config).expect("world");
        let mut rng = StdRng::seed_from_u64(2);
        let table = PortTable::create(&world, &place_ports(2, 10.0, &mut rng)).expect("ports");
        let attached = PortTable::attach(&world).expect("attach");
        assert_eq!(attached.get(1).unwrap().dock().available(), 3);
        assert_eq!(attached.position(1).unwrap(), Coord::new(10.0, 0.0));
        assert!(table.get(2).is_err());
    }
}
