//! Port agent: commerce server, daily offer/demand generation and expiry,
//! swell reaction.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;

use super::{Exit, Pacer};
use crate::commerce::{Intent, Message, Status};
use crate::context::{rng_for, Context};
use crate::core::{Error, Result};
use crate::hazard::Hazard;
use crate::hold::{Batch, CargoHold};
use crate::records::PortRecord;

/// Docks taken by an ongoing swell.
struct Swell {
    until: Instant,
    held: u32,
}

pub struct PortAgent {
    id: usize,
    ctx: Context,
    pacer: Pacer,
    /// When the goods this port has put on offer go bad.
    expiring: CargoHold,
    rng: StdRng,
    current_day: u32,
    swell: Option<Swell>,
}

impl PortAgent {
    pub fn new(ctx: Context, id: usize) -> Result<Self> {
        ctx.ports.get(id)?.set_pid(std::process::id());
        Ok(Self {
            id,
            pacer: Pacer::new(ctx.config()),
            rng: rng_for(ctx.config(), 2_000 + id as u64),
            current_day: ctx.world.current_day(),
            ctx,
            expiring: CargoHold::new(),
            swell: None,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn expiring(&self) -> &CargoHold {
        &self.expiring
    }

    fn record(&self) -> Result<&PortRecord> {
        self.ctx.ports.get(self.id)
    }

    pub fn run(mut self) -> Result<Exit> {
        log::info!("port {}: open", self.id);
        self.generate()?;
        let outcome = loop {
            if let Err(err) = self.step() {
                break err;
            }
        };
        self.end_swell();
        match outcome {
            Error::Terminated => {
                log::info!("port {}: closed", self.id);
                Ok(Exit::Terminated)
            }
            Error::HazardFault { .. } => Ok(Exit::Faulted),
            err => {
                log::error!("port {}: {err}", self.id);
                Err(err)
            }
        }
    }

    /// One pass of the server loop: hazards, day upkeep, swell bookkeeping,
    /// then at most one request served.
    pub fn step(&mut self) -> Result<()> {
        self.drain()?;
        let day = self.ctx.world.current_day();
        if day > self.current_day {
            self.current_day = day;
            self.expire();
            self.generate()?;
        }
        self.tend_swell();
        if let Some(request) = self
            .ctx
            .commerce
            .recv_request(self.id, Some(self.pacer.slice()))?
        {
            self.serve(&request)?;
        }
        Ok(())
    }

    /// One generation pass worth a day's fill budget.
    pub fn generate(&mut self) -> Result<()> {
        let budget = self.ctx.config().fill_per_day();
        let activity = self.ctx.ledger.generate_random_activity(
            self.id,
            &mut self.expiring,
            &self.ctx.catalog,
            self.current_day,
            budget,
            &mut self.rng,
        )?;
        log::debug!(
            "port {}: day {} offered {} demanded {}",
            self.id,
            self.current_day,
            activity.offered.total(),
            activity.demanded.total()
        );
        Ok(())
    }

    /// Withdraws offers whose shelf life ran out today.
    pub fn expire(&mut self) -> Vec<Batch> {
        let expired = self.expiring.remove_expired(self.current_day);
        for batch in &expired {
            if let Err(err) = self.ctx.ledger.remove_offer(self.id, batch.good, batch.quantity) {
                log::warn!("port {}: expiry of good {} failed: {err}", self.id, batch.good);
                continue;
            }
            self.ctx.catalog.record_expired_port(batch.good, batch.quantity);
        }
        expired
    }

    pub fn serve(&mut self, request: &Message) -> Result<()> {
        if request.status != Status::Request {
            log::warn!("port {}: ignoring {:?} from ship {}", self.id, request.status, request.sender);
            return Ok(());
        }
        if !self.claim(request) {
            log::debug!(
                "port {}: ship {} gave up on exchange {}, not settling",
                self.id,
                request.sender,
                request.exchange
            );
            return Ok(());
        }
        let served = match request.intent {
            Intent::Sell if request.good >= self.ctx.world.goods() => {
                log::warn!(
                    "port {}: ship {} sells unknown good {}",
                    self.id,
                    request.sender,
                    request.good
                );
                let mut refused = request.reply(Status::Refused);
                refused.quantity = 0;
                self.ctx.commerce.send_reply(&refused)
            }
            Intent::Sell => self.serve_sale(request),
            Intent::Load => self.serve_load(request),
        };
        match served {
            // The ship stopped listening; what it did not collect is lost.
            Err(Error::ChannelFull(ship)) => {
                log::warn!("port {}: reply mailbox of ship {ship} is full", self.id);
                Ok(())
            }
            other => other,
        }
    }

    /// Takes on the sender's exchange. A request the ship already gave up on,
    /// or one from an unknown sender, is left unsettled.
    fn claim(&self, request: &Message) -> bool {
        match self.ctx.ships.get(request.sender) {
            Ok(ship) => ship.claim_exchange(request.exchange),
            Err(err) => {
                log::warn!("port {}: {err}", self.id);
                false
            }
        }
    }

    fn serve_sale(&mut self, request: &Message) -> Result<()> {
        let accepted = self
            .ctx
            .ledger
            .settle_sale(self.id, request.good, request.quantity)?;
        let mut reply = request.reply(if accepted > 0 {
            Status::Accepted
        } else {
            Status::Refused
        });
        reply.quantity = accepted;
        if accepted > 0 {
            self.ctx.catalog.record_delivered(request.good, accepted);
        }
        log::debug!(
            "port {}: ship {} sells {} of good {}, accepted {accepted}",
            self.id,
            request.sender,
            request.quantity,
            request.good
        );
        self.ctx.commerce.send_reply(&reply)
    }

    fn serve_load(&mut self, request: &Message) -> Result<()> {
        let capacity = request.quantity.min(self.ctx.config().capacity);
        let order = self.ctx.ledger.allocate_order(self.id, capacity)?;
        if order.is_empty() {
            let mut refused = request.reply(Status::Refused);
            refused.quantity = 0;
            return self.ctx.commerce.send_reply(&refused);
        }
        for (good, quantity) in order.iter() {
            let mut batches = self.expiring.take(good, quantity);
            let covered: i64 = batches.iter().map(|batch| batch.quantity).sum();
            if covered < quantity {
                // Offers with no expiry entry left get a fresh shelf life.
                batches.push(Batch {
                    good,
                    quantity: quantity - covered,
                    expiry: self.current_day + self.ctx.catalog.life(good),
                });
            }
            for batch in batches {
                let mut reply = request.reply(Status::LoadAccepted);
                reply.good = batch.good;
                reply.quantity = batch.quantity;
                reply.expiry = batch.expiry;
                self.ctx.commerce.send_reply(&reply)?;
            }
        }
        let mut done = request.reply(Status::Accepted);
        done.quantity = order.total();
        log::debug!("port {}: ship {} loads {}", self.id, request.sender, order.total());
        self.ctx.commerce.send_reply(&done)
    }

    fn drain(&mut self) -> Result<()> {
        if self.ctx.world.is_shutdown() {
            return Err(Error::Terminated);
        }
        loop {
            let Some(hazard) = self.record()?.inbox().take() else {
                return Ok(());
            };
            match hazard {
                Hazard::Swell => self.begin_swell()?,
                Hazard::Terminate => return Err(Error::Terminated),
                Hazard::Fault | Hazard::Maelstrom => {
                    return Err(Error::HazardFault {
                        agent: self.id,
                        hazard: hazard.name(),
                    })
                }
                Hazard::Storm => log::debug!("port {}: ignoring storm", self.id),
            }
        }
    }

    /// Starts or extends a swell. Docks are taken as they free up so ships
    /// already docked can finish trading.
    fn begin_swell(&mut self) -> Result<()> {
        let duration = self.pacer.hours(self.ctx.config().swell_duration);
        self.record()?.record_swell();
        log::info!("port {}: swell, docks closing", self.id);
        let until = Instant::now() + duration;
        match &mut self.swell {
            Some(swell) => swell.until = swell.until.max(until),
            None => self.swell = Some(Swell { until, held: 0 }),
        }
        self.tend_swell();
        Ok(())
    }

    fn tend_swell(&mut self) {
        let over = match &self.swell {
            Some(swell) => Instant::now() >= swell.until,
            None => return,
        };
        if over {
            self.end_swell();
            return;
        }
        let (Ok(record), Some(swell)) = (self.ctx.ports.get(self.id), self.swell.as_mut()) else {
            return;
        };
        let dock = record.dock();
        while swell.held < dock.capacity() && dock.try_acquire() {
            swell.held += 1;
        }
    }

    fn end_swell(&mut self) {
        let Some(swell) = self.swell.take() else {
            return;
        };
        let Ok(record) = self.ctx.ports.get(self.id) else {
            return;
        };
        for _ in 0..swell.held {
            if let Err(err) = record.dock().release() {
                log::error!("port {}: releasing swell dock failed: {err}", self.id);
            }
        }
        log::info!("port {}: swell over, {} docks reopened", self.id, swell.held);
    }

    /// Docks currently held by a swell.
    pub fn swell_docks(&self) -> u32 {
        self.swell.as_ref().map_or(0, |swell| swell.held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::core::RegionKey;

    fn context(dir: &std::path::Path, key: u32) -> Context {
        let config = WorldConfig {
            ports: 2,
            goods: 2,
            ships: 1,
            docks: 2,
            day_length_ms: 100,
            seed: Some(5),
            ..WorldConfig::default()
        };
        Context::create(dir, RegionKey(key), &config).expect("context")
    }

    fn replies(ctx: &Context, exchange: u64) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = ctx
            .commerce
            .recv_reply(0, exchange, Some(Duration::from_millis(5)))
        {
            out.push(msg);
        }
        out
    }

    #[test]
    fn sale_is_capped_by_demand() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), 1100);
        let mut port = PortAgent::new(ctx.clone(), 1).unwrap();
        ctx.ledger.add_demand(1, 0, 3).unwrap();

        let ship = ctx.ships.get(0).unwrap();
        let mut sell = Message::request(1, 0, 1, Intent::Sell);
        sell.quantity = 5;
        ship.open_exchange(1);
        port.serve(&sell).unwrap();
        let got = replies(&ctx, 1);
        assert_eq!(got.len(), 1);
        assert_eq!((got[0].status, got[0].quantity), (Status::Accepted, 3));
        assert_eq!(ctx.ledger.demand(1, 0).unwrap(), 0);

        ship.open_exchange(2);
        port.serve(&Message { exchange: 2, ..sell }).unwrap();
        assert_eq!(replies(&ctx, 2)[0].status, Status::Refused);
    }

    #[test]
    fn withdrawn_exchange_is_left_unsettled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), 1140);
        let mut port = PortAgent::new(ctx.clone(), 1).unwrap();
        ctx.ledger.add_demand(1, 0, 3).unwrap();
        ctx.ledger.add_offer(1, 1, 4).unwrap();
        let ship = ctx.ships.get(0).unwrap();

        let mut sell = Message::request(1, 0, 1, Intent::Sell);
        sell.quantity = 3;
        ship.open_exchange(1);
        assert!(ship.withdraw_exchange(1));
        port.serve(&sell).unwrap();

        let mut load = Message::request(1, 0, 2, Intent::Load);
        load.quantity = 4;
        port.serve(&load).unwrap();

        assert!(replies(&ctx, 1).is_empty());
        assert!(replies(&ctx, 2).is_empty());
        assert_eq!(ctx.ledger.demand(1, 0).unwrap(), 3);
        assert_eq!(ctx.ledger.offer(1, 1).unwrap(), 4);
        assert_eq!(ctx.catalog.stats(0).delivered, 0);
    }

    #[test]
    fn sale_of_unknown_good_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), 1150);
        let mut port = PortAgent::new(ctx.clone(), 0).unwrap();
        let mut sell = Message::request(0, 0, 4, Intent::Sell);
        sell.good = 9;
        sell.quantity = 1;
        ctx.ships.get(0).unwrap().open_exchange(4);
        port.serve(&sell).unwrap();
        assert_eq!(replies(&ctx, 4)[0].status, Status::Refused);
    }

    #[test]
    fn load_streams_batches_then_total() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), 1110);
        let mut port = PortAgent::new(ctx.clone(), 0).unwrap();
        port.expiring.add(1, 4, 7);
        port.expiring.add(1, 6, 9);
        ctx.ledger.add_offer(0, 1, 10).unwrap();

        let mut load = Message::request(0, 0, 3, Intent::Load);
        load.quantity = 8;
        ctx.ships.get(0).unwrap().open_exchange(3);
        port.serve(&load).unwrap();
        let got = replies(&ctx, 3);
        let batches: Vec<(i64, u32)> = got
            .iter()
            .filter(|m| m.status == Status::LoadAccepted)
            .map(|m| (m.quantity, m.expiry))
            .collect();
        assert_eq!(batches, vec![(4, 7), (4, 9)]);
        assert_eq!(got.last().map(|m| (m.status, m.quantity)), Some((Status::Accepted, 8)));
        assert_eq!(ctx.ledger.offer(0, 1).unwrap(), 2);
        assert_eq!(port.expiring().quantity_of(1), 2);
    }

    #[test]
    fn expiry_withdraws_offers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), 1120);
        let mut port = PortAgent::new(ctx.clone(), 0).unwrap();
        port.expiring.add(0, 5, 1);
        ctx.ledger.add_offer(0, 0, 5).unwrap();
        port.current_day = 1;
        assert_eq!(port.expire().len(), 1);
        assert_eq!(ctx.ledger.offer(0, 0).unwrap(), 0);
        assert_eq!(ctx.catalog.stats(0).expired_port, 5);
        assert!(port.expire().is_empty());
    }

    #[test]
    fn swell_takes_free_docks_and_returns_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(dir.path(), 1130);
        let mut port = PortAgent::new(ctx.clone(), 1).unwrap();
        let dock = ctx.ports.get(1).unwrap().dock();
        assert!(dock.try_acquire());

        ctx.ports.get(1).unwrap().inbox().deliver(Hazard::Swell).unwrap();
        port.drain().unwrap();
        assert_eq!(port.swell_docks(), 1);
        assert_eq!(dock.available(), 0);

        dock.release().unwrap();
        port.tend_swell();
        assert_eq!(port.swell_docks(), 2);

        // Default swell: 12 hours of a 100 ms day.
        std::thread::sleep(Duration::from_millis(60));
        port.tend_swell();
        assert_eq!(port.swell_docks(), 0);
        assert_eq!(dock.available(), 2);
        assert_eq!(ctx.ports.get(1).unwrap().swells(), 1);
    }
}
