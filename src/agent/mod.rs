//! Long-lived agent loops: ships, ports, the hazard dispatcher and the day
//! clock. Each runs on its own thread or process against an attached
//! [`Context`](crate::context::Context).

pub mod clock;
pub mod port;
pub mod ship;
pub mod weather;

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::WorldConfig;
use crate::core::Result;
use crate::hazard::HazardInbox;

pub use clock::DayClock;
pub use port::PortAgent;
pub use ship::ShipAgent;
pub use weather::HazardDispatcher;

const MAX_SLICE: Duration = Duration::from_millis(50);
const MIN_SLICE: Duration = Duration::from_millis(1);

/// How an agent loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exit {
    /// Shutdown requested through the world or a terminate hazard.
    Terminated,
    /// Struck by a maelstrom.
    Sunk,
    /// Unrecoverable fault hazard.
    Faulted,
}

/// Turns simulated days into real time and sleeps in short slices so the
/// caller can react to hazards mid-sleep.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    day_length: Duration,
    slice: Duration,
}

impl Pacer {
    pub fn new(config: &WorldConfig) -> Self {
        let day_length = config.day_length();
        Self {
            day_length,
            slice: (day_length / 24).clamp(MIN_SLICE, MAX_SLICE),
        }
    }

    pub fn slice(&self) -> Duration {
        self.slice
    }

    pub fn days(&self, days: f64) -> Duration {
        Duration::from_secs_f64(days.max(0.0) * self.day_length.as_secs_f64())
    }

    pub fn hours(&self, hours: u32) -> Duration {
        self.days(WorldConfig::hours_to_days(hours))
    }

    /// Sleeps for `total`, waking early on hazard delivery to `inbox`.
    ///
    /// `checkpoint` runs before every slice. It may fail to abandon the sleep
    /// or return extra time to append (a storm caught mid-sleep).
    pub fn sleep<F>(&self, total: Duration, inbox: &HazardInbox, mut checkpoint: F) -> Result<()>
    where
        F: FnMut() -> Result<Duration>,
    {
        let mut remaining = total;
        loop {
            remaining += checkpoint()?;
            if remaining.is_zero() {
                return Ok(());
            }
            let step = remaining.min(self.slice);
            let started = Instant::now();
            inbox.wait(step)?;
            remaining = remaining.saturating_sub(started.elapsed());
        }
    }
}
