//! Simulation parameters.
//!
//! The bootstrap process loads a [`WorldConfig`] (JSON, every field optional)
//! and stores it in the world registry; every other agent reads it back from
//! there so all processes share one set of values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Global simulation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Number of ports. The first four sit at the map corners.
    pub ports: usize,
    /// Number of distinct goods.
    pub goods: usize,
    /// Number of ships.
    pub ships: usize,
    /// Side length of the square map.
    pub map_side: f64,
    /// Ship speed in map units per day.
    pub speed: f64,
    /// Units a ship may take on in a single load order.
    pub capacity: i64,
    /// Ships that may occupy one port's docks at once.
    pub docks: u32,
    /// Total fill weight generated per port over one cycle of `days`.
    pub fill: i64,
    /// Simulation length in days; also the generation cycle length.
    pub days: u32,
    /// Tons moved per hour while loading or unloading.
    pub load_speed: i64,
    pub min_size: i64,
    pub max_size: i64,
    /// Shelf life bounds in days.
    pub min_life: u32,
    pub max_life: u32,
    /// Hours a storm keeps a ship idle.
    pub storm_duration: u32,
    /// Hours a swell closes a port.
    pub swell_duration: u32,
    /// Hours between maelstroms.
    pub maelstrom: u32,
    /// Real milliseconds per simulated day.
    pub day_length_ms: u64,
    /// Bounded wait for commerce replies; `None` blocks indefinitely.
    pub reply_timeout_ms: Option<u64>,
    pub seed: Option<u64>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            ports: 5,
            goods: 4,
            ships: 6,
            map_side: 1000.0,
            speed: 250.0,
            capacity: 100,
            docks: 1,
            fill: 2000,
            days: 10,
            load_speed: 40,
            min_size: 1,
            max_size: 10,
            min_life: 3,
            max_life: 8,
            storm_duration: 6,
            swell_duration: 12,
            maelstrom: 36,
            day_length_ms: 1000,
            reply_timeout_ms: Some(10_000),
            seed: None,
        }
    }
}

impl WorldConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let config: WorldConfig = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn reject(msg: &str) -> Result<()> {
            Err(Error::InvalidArgument(msg.to_string()))
        }
        if self.ports == 0 {
            return reject("ports must be at least 1");
        }
        if self.goods == 0 {
            return reject("goods must be at least 1");
        }
        if self.ships == 0 {
            return reject("ships must be at least 1");
        }
        if !(self.map_side > 0.0) || !(self.speed > 0.0) {
            return reject("map_side and speed must be positive");
        }
        if self.docks == 0 {
            return reject("docks must be at least 1");
        }
        if self.days == 0 || self.day_length_ms == 0 {
            return reject("days and day_length_ms must be positive");
        }
        if self.load_speed <= 0 || self.capacity <= 0 || self.fill < 0 {
            return reject("load_speed and capacity must be positive, fill non-negative");
        }
        if self.min_size < 1 || self.max_size < self.min_size {
            return reject("size bounds must satisfy 1 <= min_size <= max_size");
        }
        if self.min_life < 1 || self.max_life < self.min_life {
            return reject("life bounds must satisfy 1 <= min_life <= max_life");
        }
        if self.maelstrom == 0 {
            return reject("maelstrom interval must be positive");
        }
        Ok(())
    }

    /// Weight budget of one generation pass.
    pub fn fill_per_day(&self) -> i64 {
        self.fill / i64::from(self.days)
    }

    pub fn day_length(&self) -> Duration {
        Duration::from_millis(self.day_length_ms)
    }

    /// Real duration of `days` simulated days.
    pub fn real_duration(&self, days: f64) -> Duration {
        Duration::from_secs_f64((days.max(0.0) * self.day_length_ms as f64) / 1000.0)
    }

    pub fn hours_to_days(hours: u32) -> f64 {
        f64::from(hours) / 24.0
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }

    pub fn maelstrom_period(&self) -> Duration {
        self.real_duration(Self::hours_to_days(self.maelstrom))
    }
}
