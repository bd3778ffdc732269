//! Every shared region an agent works with, attached once and passed
//! explicitly through the agent loops.

use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::catalog::Catalog;
use crate::commerce::Commerce;
use crate::config::WorldConfig;
use crate::core::{RegionKey, Result};
use crate::ledger::Ledger;
use crate::records::{place_ports, PortTable, ShipTable};
use crate::world::World;

#[derive(Clone)]
pub struct Context {
    pub world: Arc<World>,
    pub catalog: Arc<Catalog>,
    pub ledger: Arc<Ledger>,
    pub ships: Arc<ShipTable>,
    pub ports: Arc<PortTable>,
    pub commerce: Arc<Commerce>,
}

/// Seeded when the config carries a seed, from entropy otherwise.
pub fn rng_for(config: &WorldConfig, stream: u64) -> StdRng {
    match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_entropy(),
    }
}

impl Context {
    /// Bootstrap: creates the registry and every region it names. A failure
    /// part-way removes whatever was already created.
    pub fn create(root: &Path, key: RegionKey, config: &WorldConfig) -> Result<Self> {
        match Self::build(root, key, config) {
            Ok(ctx) => Ok(ctx),
            Err(err) => {
                log::error!("bootstrap of world {:#010x} failed: {err}", key.0);
                World::purge(root, key)?;
                Err(err)
            }
        }
    }

    fn build(root: &Path, key: RegionKey, config: &WorldConfig) -> Result<Self> {
        let world = World::create(root, key, config)?;
        let mut rng = rng_for(config, 0);
        let catalog = Catalog::create(&world, &mut rng)?;
        let ledger = Ledger::create(&world)?;
        let ships = ShipTable::create(&world)?;
        let positions = place_ports(config.ports, config.map_side, &mut rng);
        let ports = PortTable::create(&world, &positions)?;
        let commerce = Commerce::create(&world)?;
        Ok(Self {
            world: Arc::new(world),
            catalog: Arc::new(catalog),
            ledger: Arc::new(ledger),
            ships: Arc::new(ships),
            ports: Arc::new(ports),
            commerce: Arc::new(commerce),
        })
    }

    /// Attaches the registry first, then everything it names.
    pub fn attach(root: &Path, key: RegionKey) -> Result<Self> {
        let world = World::attach(root, key)?;
        Ok(Self {
            catalog: Arc::new(Catalog::attach(&world)?),
            ledger: Arc::new(Ledger::attach(&world)?),
            ships: Arc::new(ShipTable::attach(&world)?),
            ports: Arc::new(PortTable::attach(&world)?),
            commerce: Arc::new(Commerce::attach(&world)?),
            world: Arc::new(world),
        })
    }

    pub fn config(&self) -> &WorldConfig {
        self.world.config()
    }
}
