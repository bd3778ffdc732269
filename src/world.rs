//! The world registry: the first region every agent attaches.
//!
//! It carries the serialized [`WorldConfig`], the keys of every other region,
//! the current simulated day and the shutdown flag. Only the time-keeper
//! writes the day; only bootstrap writes the rest.

use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::WorldConfig;
use crate::core::region::{align_for, Shared};
use crate::core::wait::{futex_wait, futex_wake};
use crate::core::{Error, Region, RegionKey, Result};

pub const WORLD_MAGIC: u32 = 0x5457_4e44; // 'TWND'
pub const WORLD_VERSION: u32 = 1;
pub const DEFAULT_WORLD_KEY: RegionKey = RegionKey(0x7744_0000);

const CONFIG_CAPACITY: usize = 4096;
const INIT_READY: u32 = 2;

/// Regions named by the registry, in key order after the world key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionSlot {
    Catalog = 0,
    Offers = 1,
    Demand = 2,
    Ships = 3,
    Ports = 4,
    Requests = 5,
    Replies = 6,
}

impl RegionSlot {
    pub const ALL: [RegionSlot; 7] = [
        RegionSlot::Catalog,
        RegionSlot::Offers,
        RegionSlot::Demand,
        RegionSlot::Ships,
        RegionSlot::Ports,
        RegionSlot::Requests,
        RegionSlot::Replies,
    ];
}

#[repr(C, align(64))]
pub struct WorldBlock {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub init_state: AtomicU32,
    pub config_len: AtomicU32,
    pub config_crc: AtomicU32,
    pub shutdown: AtomicU32,
    /// Current day; also the futex word day waiters sleep on.
    pub day: AtomicU32,
    pub _pad0: AtomicU32,
    pub keys: [AtomicU32; 8],
}

unsafe impl Shared for WorldBlock {}

pub struct World {
    root: PathBuf,
    region: Region,
    block: *const WorldBlock,
    config: WorldConfig,
}

// SAFETY: the block pointer targets the mapping owned by `region`, which lives
// as long as `World`; every field behind it is atomic.
unsafe impl Send for World {}
unsafe impl Sync for World {}

fn config_offset() -> usize {
    align_for::<u64>(size_of::<WorldBlock>())
}

impl World {
    pub fn create(root: &Path, key: RegionKey, config: &WorldConfig) -> Result<Self> {
        config.validate()?;
        let blob = serde_json::to_vec(config)?;
        if blob.len() > CONFIG_CAPACITY {
            return Err(Error::InvalidArgument("serialized config too large".into()));
        }
        let mut region = Region::create(root, key, config_offset() + CONFIG_CAPACITY)?;
        region.write_at(config_offset(), &blob)?;
        let block = region.view::<WorldBlock>(0, 1)?.as_ptr();
        let world = Self {
            root: root.to_path_buf(),
            region,
            block,
            config: config.clone(),
        };

        let b = world.block();
        b.init_state.store(1, Ordering::Relaxed);
        b.version.store(WORLD_VERSION, Ordering::Relaxed);
        b.config_len.store(blob.len() as u32, Ordering::Relaxed);
        b.config_crc.store(crc32fast::hash(&blob), Ordering::Relaxed);
        for slot in RegionSlot::ALL {
            b.keys[slot as usize].store(key.offset(slot as u32 + 1).0, Ordering::Relaxed);
        }
        b.day.store(0, Ordering::Relaxed);
        b.shutdown.store(0, Ordering::Relaxed);
        b.magic.store(WORLD_MAGIC, Ordering::Relaxed);
        b.init_state.store(INIT_READY, Ordering::Release);
        log::info!(
            "world {:#010x} created: {} ports, {} goods, {} ships",
            key.0,
            config.ports,
            config.goods,
            config.ships
        );
        Ok(world)
    }

    pub fn attach(root: &Path, key: RegionKey) -> Result<Self> {
        let region = Region::attach(root, key)?;
        let block = region.view::<WorldBlock>(0, 1)?.as_ptr();
        let b = unsafe { &*block };
        if b.init_state.load(Ordering::Acquire) != INIT_READY {
            return Err(Error::Attach {
                key: key.0,
                reason: "world not initialised",
            });
        }
        if b.magic.load(Ordering::Acquire) != WORLD_MAGIC {
            return Err(Error::Corrupt("world magic mismatch"));
        }
        if b.version.load(Ordering::Acquire) != WORLD_VERSION {
            return Err(Error::Corrupt("world version mismatch"));
        }
        let len = b.config_len.load(Ordering::Acquire) as usize;
        let start = config_offset();
        let blob = region
            .read()
            .get(start..start + len)
            .ok_or(Error::Corrupt("config blob out of bounds"))?;
        if crc32fast::hash(blob) != b.config_crc.load(Ordering::Acquire) {
            return Err(Error::Corrupt("config crc mismatch"));
        }
        let config: WorldConfig = serde_json::from_slice(blob)?;
        Ok(Self {
            root: root.to_path_buf(),
            region,
            block,
            config,
        })
    }

    pub fn block(&self) -> &WorldBlock {
        unsafe { &*self.block }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn ports(&self) -> usize {
        self.config.ports
    }

    pub fn goods(&self) -> usize {
        self.config.goods
    }

    pub fn ships(&self) -> usize {
        self.config.ships
    }

    pub fn map_side(&self) -> f64 {
        self.config.map_side
    }

    pub fn speed(&self) -> f64 {
        self.config.speed
    }

    pub fn load_speed(&self) -> i64 {
        self.config.load_speed
    }

    pub fn region_key(&self, slot: RegionSlot) -> RegionKey {
        RegionKey(self.block().keys[slot as usize].load(Ordering::Acquire))
    }

    pub fn current_day(&self) -> u32 {
        self.block().day.load(Ordering::Acquire)
    }

    /// Moves the day counter forward by one and wakes every day waiter.
    pub fn advance_day(&self) -> Result<u32> {
        let day = self.block().day.fetch_add(1, Ordering::AcqRel) + 1;
        futex_wake(&self.block().day)?;
        Ok(day)
    }

    /// Blocks until the day differs from `seen` or `timeout` elapses.
    pub fn wait_day_change(&self, seen: u32, timeout: Option<Duration>) -> Result<u32> {
        let day = self.current_day();
        if day != seen {
            return Ok(day);
        }
        futex_wait(&self.block().day, seen, timeout)?;
        Ok(self.current_day())
    }

    pub fn request_shutdown(&self) -> Result<()> {
        self.block().shutdown.store(1, Ordering::Release);
        // Day waiters re-check the shutdown flag when woken.
        futex_wake(&self.block().day)
    }

    pub fn is_shutdown(&self) -> bool {
        self.block().shutdown.load(Ordering::Acquire) != 0
    }

    /// Removes every region a world under `key` would own, without attaching.
    /// Works on half-built or corrupt worlds.
    pub fn purge(root: &Path, key: RegionKey) -> Result<()> {
        for slot in RegionSlot::ALL {
            Region::destroy_key(root, key.offset(slot as u32 + 1))?;
        }
        Region::destroy_key(root, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_reads_back_config_and_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = WorldConfig {
            ports: 3,
            seed: Some(9),
            ..WorldConfig::default()
        };
        let created = World::create(dir.path(), RegionKey(100), &config).expect("create");
        let attached = World::attach(dir.path(), RegionKey(100)).expect("attach");

        assert_eq!(attached.config(), &config);
        assert_eq!(attached.region_key(RegionSlot::Catalog), RegionKey(101));
        assert_eq!(attached.region_key(RegionSlot::Replies), RegionKey(107));

        created.advance_day().expect("advance");
        assert_eq!(attached.current_day(), 1);
        assert_eq!(
            attached.wait_day_change(0, Some(Duration::from_millis(1))).expect("wait"),
            1
        );
    }

    #[test]
    fn shutdown_is_visible_to_attached_processes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let world =
            World::create(dir.path(), RegionKey(200), &WorldConfig::default()).expect("create");
        let other = World::attach(dir.path(), RegionKey(200)).expect("attach");
        assert!(!other.is_shutdown());
        world.request_shutdown().expect("shutdown");
        assert!(other.is_shutdown());
    }

    #[test]
    fn attach_detects_corrupt_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _world =
            World::create(dir.path(), RegionKey(300), &WorldConfig::default()).expect("create");
        let mut raw = Region::attach(dir.path(), RegionKey(300)).expect("raw attach");
        raw.write_at(config_offset(), b"{").expect("scribble");
        assert!(matches!(
            World::attach(dir.path(), RegionKey(300)),
            Err(Error::Corrupt(_))
        ));
    }
}
