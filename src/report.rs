//! End-of-run (or live) telemetry snapshot, read straight out of the shared
//! regions.

use serde::Serialize;

use crate::catalog::GoodStats;
use crate::context::Context;
use crate::core::Result;
use crate::records::ShipFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortAmount {
    pub port: usize,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoodReport {
    pub good: usize,
    pub size: i64,
    pub life: u32,
    #[serde(flatten)]
    pub stats: GoodStats,
    /// Offer quantity currently sitting in ports.
    pub in_ports: i64,
    pub top_offer: Option<PortAmount>,
    pub top_demand: Option<PortAmount>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetReport {
    pub dead: usize,
    pub at_sea_with_cargo: usize,
    pub at_sea_empty: usize,
    pub docked: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub day: u32,
    pub goods: Vec<GoodReport>,
    pub fleet: FleetReport,
    pub storms: u32,
    pub swells: u32,
    pub maelstroms: u32,
}

impl Report {
    pub fn collect(ctx: &Context) -> Result<Self> {
        let catalog = &ctx.catalog;
        let mut goods = Vec::with_capacity(catalog.goods());
        for good in 0..catalog.goods() {
            let mut in_ports = 0;
            for port in 0..ctx.ledger.ports() {
                in_ports += ctx.ledger.offer(port, good)?;
            }
            let spec = catalog.spec(good);
            goods.push(GoodReport {
                good,
                size: spec.size,
                life: spec.life,
                stats: catalog.stats(good),
                in_ports,
                top_offer: catalog
                    .port_with_max_offer(good)
                    .map(|(port, quantity)| PortAmount { port, quantity }),
                top_demand: catalog
                    .port_with_max_demand(good)
                    .map(|(port, quantity)| PortAmount { port, quantity }),
            });
        }

        let mut fleet = FleetReport::default();
        let mut storms = 0;
        let mut maelstroms = 0;
        for ship in ctx.ships.records() {
            storms += ship.storms();
            maelstroms += ship.maelstroms();
            if ship.is_dead() {
                fleet.dead += 1;
            } else if ship.flag(ShipFlag::AtDock) {
                fleet.docked += 1;
            } else if ship.flag(ShipFlag::WithCargo) {
                fleet.at_sea_with_cargo += 1;
            } else {
                fleet.at_sea_empty += 1;
            }
        }
        let swells = ctx.ports.records().iter().map(|port| port.swells()).sum();

        Ok(Self {
            day: ctx.world.current_day(),
            goods,
            fleet,
            storms,
            swells,
            maelstroms,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::core::RegionKey;

    #[test]
    fn summarises_goods_and_fleet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = WorldConfig {
            ports: 2,
            goods: 2,
            ships: 3,
            seed: Some(4),
            ..WorldConfig::default()
        };
        let ctx = Context::create(dir.path(), RegionKey(1400), &config).expect("context");
        ctx.ledger.add_offer(0, 1, 5).unwrap();
        ctx.ledger.add_offer(1, 1, 2).unwrap();
        ctx.catalog.record_offer(1, 1, 9);
        ctx.ships.get(0).unwrap().set_flag(ShipFlag::Dead, true);
        ctx.ships.get(1).unwrap().set_flag(ShipFlag::AtDock, true);
        ctx.ships.get(2).unwrap().record_storm();
        ctx.ports.get(1).unwrap().record_swell();

        let report = Report::collect(&ctx).unwrap();
        assert_eq!(report.goods[1].in_ports, 7);
        assert_eq!(
            report.goods[1].top_offer,
            Some(PortAmount { port: 1, quantity: 9 })
        );
        assert_eq!(report.goods[0].top_demand, None);
        assert_eq!(
            report.fleet,
            FleetReport {
                dead: 1,
                docked: 1,
                at_sea_empty: 1,
                at_sea_with_cargo: 0
            }
        );
        assert_eq!((report.storms, report.swells), (1, 1));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["goods"][1]["in_ports"], 7);
        assert!(json["goods"][0].get("generated").is_some());
    }
}
