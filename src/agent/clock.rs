use std::thread;
use std::time::{Duration, Instant};

use super::Exit;
use crate::context::Context;
use crate::core::Result;
use crate::hazard::Hazard;

const POLL: Duration = Duration::from_millis(10);

/// Time-keeper: the only writer of the day counter.
pub struct DayClock {
    ctx: Context,
}

impl DayClock {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Advances one day per configured day length. After the last day it
    /// raises the shutdown flag and sends every agent a terminate hazard so
    /// sleepers wake up.
    pub fn run(self) -> Result<Exit> {
        let config = self.ctx.config();
        let mut next = Instant::now() + config.day_length();
        while self.ctx.world.current_day() < config.days {
            if self.ctx.world.is_shutdown() {
                return Ok(Exit::Terminated);
            }
            let now = Instant::now();
            if now < next {
                thread::sleep((next - now).min(POLL));
                continue;
            }
            let day = self.ctx.world.advance_day()?;
            log::info!("clock: day {day}");
            next += config.day_length();
        }
        self.shutdown()?;
        Ok(Exit::Terminated)
    }

    pub fn shutdown(&self) -> Result<()> {
        log::info!("clock: simulation over, shutting down");
        self.ctx.world.request_shutdown()?;
        for ship in self.ctx.ships.records() {
            ship.inbox().deliver(Hazard::Terminate)?;
        }
        for port in self.ctx.ports.records() {
            port.inbox().deliver(Hazard::Terminate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::core::RegionKey;

    #[test]
    fn counts_days_then_shuts_down() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = WorldConfig {
            days: 3,
            day_length_ms: 10,
            ..WorldConfig::default()
        };
        let ctx = Context::create(dir.path(), RegionKey(1300), &config).expect("context");
        let started = Instant::now();
        assert_eq!(DayClock::new(ctx.clone()).run().unwrap(), Exit::Terminated);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(ctx.world.current_day(), 3);
        assert!(ctx.world.is_shutdown());
        assert!(ctx.ships.get(0).unwrap().inbox().is_pending(Hazard::Terminate));
    }
}
