//! Hazard dispatcher.
//!
//! Every day rollover sends a storm to one random live ship and a swell to
//! one random port. Independently, every `maelstrom` hours a maelstrom goes
//! to one random live ship. Draws are uniform and independent; a ship can be
//! picked again while still serving an earlier hazard. Delivery is
//! fire-and-forget.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use super::{Exit, Pacer};
use crate::context::{rng_for, Context};
use crate::core::Result;
use crate::hazard::Hazard;

pub struct HazardDispatcher {
    ctx: Context,
    rng: StdRng,
    maelstrom_period: Duration,
}

impl HazardDispatcher {
    pub fn new(ctx: Context) -> Self {
        let pacer = Pacer::new(ctx.config());
        Self {
            rng: rng_for(ctx.config(), 3_000),
            maelstrom_period: pacer.hours(ctx.config().maelstrom),
            ctx,
        }
    }

    pub fn run(mut self) -> Result<Exit> {
        log::info!("weather: maelstrom every {:?}", self.maelstrom_period);
        let mut seen = self.ctx.world.current_day();
        let mut next_maelstrom = Instant::now() + self.maelstrom_period;
        loop {
            if self.ctx.world.is_shutdown() {
                log::info!("weather: calm");
                return Ok(Exit::Terminated);
            }
            let now = Instant::now();
            if now >= next_maelstrom {
                self.maelstrom()?;
                next_maelstrom += self.maelstrom_period;
                continue;
            }
            let day = self
                .ctx
                .world
                .wait_day_change(seen, Some(next_maelstrom - now))?;
            if day != seen {
                seen = day;
                self.storm()?;
                self.swell()?;
            }
        }
    }

    fn live_ship(&mut self) -> Option<usize> {
        self.ctx.ships.live_ids().choose(&mut self.rng).copied()
    }

    /// Returns the ship hit, if any ship is still afloat.
    pub fn storm(&mut self) -> Result<Option<usize>> {
        let Some(ship) = self.live_ship() else {
            return Ok(None);
        };
        log::debug!("weather: storm on ship {ship}");
        self.ctx.ships.get(ship)?.inbox().deliver(Hazard::Storm)?;
        Ok(Some(ship))
    }

    pub fn maelstrom(&mut self) -> Result<Option<usize>> {
        let Some(ship) = self.live_ship() else {
            return Ok(None);
        };
        log::info!("weather: maelstrom on ship {ship}");
        self.ctx.ships.get(ship)?.inbox().deliver(Hazard::Maelstrom)?;
        Ok(Some(ship))
    }

    pub fn swell(&mut self) -> Result<usize> {
        let port = self.rng.gen_range(0..self.ctx.ports.len());
        log::debug!("weather: swell on port {port}");
        self.ctx.ports.get(port)?.inbox().deliver(Hazard::Swell)?;
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::core::RegionKey;
    use crate::records::ShipFlag;

    #[test]
    fn hazards_skip_sunk_ships() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = WorldConfig {
            ships: 3,
            ports: 2,
            seed: Some(8),
            ..WorldConfig::default()
        };
        let ctx = Context::create(dir.path(), RegionKey(1200), &config).expect("context");
        ctx.ships.get(0).unwrap().set_flag(ShipFlag::Dead, true);
        ctx.ships.get(2).unwrap().set_flag(ShipFlag::Dead, true);

        let mut weather = HazardDispatcher::new(ctx.clone());
        for _ in 0..8 {
            assert_eq!(weather.storm().unwrap(), Some(1));
        }
        assert_eq!(ctx.ships.get(1).unwrap().inbox().delivered(), 8);

        ctx.ships.get(1).unwrap().set_flag(ShipFlag::Dead, true);
        assert_eq!(weather.maelstrom().unwrap(), None);

        let port = weather.swell().unwrap();
        assert!(ctx.ports.get(port).unwrap().inbox().is_pending(Hazard::Swell));
    }

    #[test]
    fn day_rollover_triggers_storm_and_swell() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = WorldConfig {
            ships: 1,
            ports: 1,
            maelstrom: 10_000,
            seed: Some(8),
            ..WorldConfig::default()
        };
        let ctx = Context::create(dir.path(), RegionKey(1210), &config).expect("context");
        let weather = {
            let ctx = ctx.clone();
            std::thread::spawn(move || HazardDispatcher::new(ctx).run())
        };
        std::thread::sleep(Duration::from_millis(20));
        ctx.world.advance_day().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ctx.ports.get(0).unwrap().inbox().delivered() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        ctx.world.request_shutdown().unwrap();
        assert_eq!(weather.join().unwrap().unwrap(), Exit::Terminated);
        assert!(ctx.ships.get(0).unwrap().inbox().is_pending(Hazard::Storm));
        assert!(ctx.ports.get(0).unwrap().inbox().is_pending(Hazard::Swell));
    }
}
