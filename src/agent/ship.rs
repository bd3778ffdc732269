//! Ship agent.
//!
//! One voyage is `pick destination -> sail -> dock -> trade -> undock`. The
//! ship's hold is private to the agent; everything observers need (position,
//! flags, damage) is mirrored into its [`ShipRecord`].
//!
//! Hazards are drained from the ship's inbox at checkpoints: before each
//! voyage step, between sleep slices and between dock-wait slices. A storm
//! adds forced downtime where it is caught. Maelstrom, fault and terminate
//! unwind the voyage with an error; every resource held on the way (the dock
//! guard above all) is released by drop before [`ShipAgent::run`] tears the
//! agent down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::Rng;

use super::{Exit, Pacer};
use crate::commerce::{Intent, Message, Status};
use crate::context::{rng_for, Context};
use crate::core::{Error, Result};
use crate::dock::DockGuard;
use crate::hazard::Hazard;
use crate::hold::CargoHold;
use crate::records::{Coord, ShipFlag, ShipRecord};

pub struct ShipAgent {
    id: usize,
    ctx: Context,
    pacer: Pacer,
    hold: CargoHold,
    rng: StdRng,
    current_day: u32,
    /// Port the ship last sailed to.
    port: Option<usize>,
    voyages: u64,
    exchange: u64,
}

impl ShipAgent {
    /// Registers the ship in its record and drops it somewhere on the map.
    pub fn new(ctx: Context, id: usize) -> Result<Self> {
        let mut rng = rng_for(ctx.config(), 1_000 + id as u64);
        let side = ctx.world.map_side();
        let record = ctx.ships.get(id)?;
        record.set_pid(std::process::id());
        record.set_position(Coord::new(rng.gen_range(0.0..=side), rng.gen_range(0.0..=side)));
        record.set_port(None);
        record.set_flag(ShipFlag::Moving, true);
        let current_day = ctx.world.current_day();
        Ok(Self {
            id,
            pacer: Pacer::new(ctx.config()),
            ctx,
            hold: CargoHold::new(),
            rng,
            current_day,
            port: None,
            voyages: 0,
            exchange: (id as u64) << 32,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn hold(&self) -> &CargoHold {
        &self.hold
    }

    pub fn hold_mut(&mut self) -> &mut CargoHold {
        &mut self.hold
    }

    /// Port the ship is at or last sailed to.
    pub fn port(&self) -> Option<usize> {
        self.port
    }

    fn record(&self) -> Result<&ShipRecord> {
        self.ctx.ships.get(self.id)
    }

    /// Runs voyages until a hazard or shutdown ends the agent, then tears it
    /// down. Errors that are not part of the agent lifecycle are returned
    /// after teardown.
    pub fn run(mut self) -> Result<Exit> {
        log::info!("ship {}: sailing", self.id);
        let outcome = loop {
            if let Err(err) = self.voyage() {
                break err;
            }
        };
        let exit = match outcome {
            Error::Terminated => Exit::Terminated,
            Error::HazardFault { hazard, .. } if hazard == Hazard::Maelstrom.name() => Exit::Sunk,
            Error::HazardFault { .. } => Exit::Faulted,
            err => {
                log::error!("ship {}: {err}", self.id);
                self.teardown(Exit::Faulted)?;
                return Err(err);
            }
        };
        self.teardown(exit)?;
        Ok(exit)
    }

    /// One full pass of the state machine.
    pub fn voyage(&mut self) -> Result<()> {
        self.checkpoint()?;
        self.tick()?;
        let dest = self.pick_destination()?;
        self.sail_to(dest)?;
        let guard = self.dock()?;
        self.trade(guard)
    }

    /// Day upkeep: purge expired cargo on rollover and advertise whether the
    /// hold is empty.
    pub fn tick(&mut self) -> Result<()> {
        self.catch_up();
        self.record()?
            .set_flag(ShipFlag::WithCargo, !self.hold.is_empty());
        Ok(())
    }

    /// Moves the cached day up to the world day, purging on rollover.
    fn catch_up(&mut self) {
        let day = self.ctx.world.current_day();
        if day > self.current_day {
            self.current_day = day;
            self.purge_expired();
        }
    }

    /// Removes the batches expired as of the cached day. Calling it again
    /// before the next rollover finds nothing.
    pub fn purge_expired(&mut self) -> i64 {
        let mut purged = 0;
        for batch in self.hold.remove_expired(self.current_day) {
            self.ctx.catalog.record_expired_ship(batch.good, batch.quantity);
            purged += batch.quantity;
        }
        if purged > 0 {
            log::debug!("ship {}: {purged} units expired on day {}", self.id, self.current_day);
        }
        purged
    }

    /// Day the ship currently acts on.
    pub fn current_day(&self) -> u32 {
        self.current_day
    }

    /// First departure goes to a random port. Later ones go to the port with
    /// the largest projected sale volume, counting only cargo that survives
    /// the trip; ties go to the nearer port. The current port is skipped.
    pub fn pick_destination(&mut self) -> Result<usize> {
        let ports = self.ctx.world.ports();
        if self.voyages == 0 || self.port.is_none() {
            return Ok(self.rng.gen_range(0..ports));
        }
        let here = self.record()?.position();
        let mut best: Option<(usize, i64, f64)> = None;
        for port in (0..ports).filter(|&p| Some(p) != self.port) {
            let travel = here.distance(&self.ctx.ports.position(port)?) / self.ctx.world.speed();
            let arrival = self.current_day + travel as u32;
            let mut volume = 0;
            for good in 0..self.ctx.world.goods() {
                let usable = self.hold.usable_on(good, arrival);
                let demand = self.ctx.ledger.demand(port, good)?;
                volume += usable.min(demand).max(0);
            }
            let better = match best {
                None => true,
                Some((_, best_volume, best_travel)) => {
                    volume > best_volume || (volume == best_volume && travel < best_travel)
                }
            };
            if better {
                best = Some((port, volume, travel));
            }
        }
        Ok(best.map_or_else(|| self.port.unwrap_or(0), |(port, _, _)| port))
    }

    /// Sails to `port`, sleeping for distance over speed simulated days.
    pub fn sail_to(&mut self, port: usize) -> Result<()> {
        let dest = self.ctx.ports.position(port)?;
        let record = self.record()?;
        let days = record.position().distance(&dest) / self.ctx.world.speed();
        record.set_flag(ShipFlag::Moving, true);
        record.set_port(Some(port));
        log::debug!("ship {}: sailing to port {port}, {days:.2} days", self.id);
        self.pause(self.pacer.days(days))?;
        let record = self.record()?;
        record.set_position(dest);
        record.set_flag(ShipFlag::Moving, false);
        self.port = Some(port);
        self.voyages += 1;
        Ok(())
    }

    /// Waits for a dock at the current port.
    pub fn dock(&mut self) -> Result<DockGuard> {
        let port = self
            .port
            .ok_or_else(|| Error::InvalidArgument(format!("ship {} is not at a port", self.id)))?;
        let slice = self.pacer.slice();
        let guard = DockGuard::acquire(self.ctx.ports.clone(), port, slice, || self.checkpoint())?;
        self.record()?.set_flag(ShipFlag::AtDock, true);
        log::debug!("ship {}: docked at port {port}", self.id);
        Ok(guard)
    }

    /// Sells every good in catalog order, then loads what the port offers.
    /// Each exchange runs masked; the handling sleeps after it do not. The
    /// dock is released when `guard` drops, on success or error.
    pub fn trade(&mut self, guard: DockGuard) -> Result<()> {
        let load_speed = self.ctx.world.load_speed() as f64;
        let ships = Arc::clone(&self.ctx.ships);
        let inbox = ships.get(self.id)?.inbox();
        for good in 0..self.ctx.world.goods() {
            let sold = {
                let _mask = inbox.mask();
                self.sell(good)?
            };
            let tons = (sold * self.ctx.catalog.size(good)) as f64;
            self.pause(self.pacer.days(tons / load_speed / 24.0))?;
        }

        let loaded = {
            let _mask = inbox.mask();
            self.load()?
        };
        self.pause(self.pacer.days(loaded as f64 / load_speed / 24.0))?;

        self.record()?.set_flag(ShipFlag::AtDock, false);
        log::debug!("ship {}: undocking from port {}", self.id, guard.port());
        drop(guard);
        self.record()?
            .set_flag(ShipFlag::WithCargo, !self.hold.is_empty());
        Ok(())
    }

    /// Offers `min(hold, port demand)` of `good` to the current port and
    /// returns the quantity actually sold. The hold is debited, oldest batch
    /// first, only when the port accepts. A timed-out or refused exchange
    /// sells nothing. Cargo that expired since the last day upkeep is purged
    /// first and never offered.
    pub fn sell(&mut self, good: usize) -> Result<i64> {
        let Some(port) = self.port else {
            return Ok(0);
        };
        self.catch_up();
        let available = self.hold.quantity_of(good);
        let demand = self.ctx.ledger.demand(port, good)?;
        let amount = available.min(demand);
        if amount <= 0 {
            return Ok(0);
        }

        let mut request = Message::request(port, self.id, self.next_exchange(), Intent::Sell);
        request.good = good;
        request.quantity = amount;
        request.expiry = self.current_day;
        let Some(reply) = self.transact(&request)? else {
            return Ok(0);
        };
        match reply.status {
            Status::Accepted if reply.quantity > 0 => {
                let sold: i64 = self
                    .hold
                    .take(good, reply.quantity.min(amount))
                    .iter()
                    .map(|batch| batch.quantity)
                    .sum();
                log::debug!("ship {}: sold {sold} of good {good} to port {port}", self.id);
                Ok(sold)
            }
            _ => Ok(0),
        }
    }

    /// Asks the current port for up to the free hold capacity and folds every
    /// `LOAD_ACCEPTED` batch into the hold. Returns the tons loaded.
    pub fn load(&mut self) -> Result<i64> {
        let Some(port) = self.port else {
            return Ok(0);
        };
        self.catch_up();
        let free = self.ctx.config().capacity - self.hold.total();
        if free <= 0 {
            return Ok(0);
        }
        let mut request = Message::request(port, self.id, self.next_exchange(), Intent::Load);
        request.quantity = free;

        self.record()?.open_exchange(request.exchange);
        let mut tons = 0;
        let outcome = self.receive_load(&request, &mut tons);
        self.record()?.close_exchange();
        match outcome {
            Ok(()) => Ok(tons),
            Err(err) => self.abandon(err).map(|_| tons),
        }
    }

    /// Folds `LOAD_ACCEPTED` batches into the hold until the port closes the
    /// exchange.
    fn receive_load(&mut self, request: &Message, tons: &mut i64) -> Result<()> {
        self.ctx.commerce.send_request(request)?;
        loop {
            let reply = self.await_reply(request.exchange)?;
            match reply.status {
                Status::LoadAccepted => {
                    if reply.good >= self.ctx.world.goods() {
                        return Err(Error::Corrupt("load reply names an unknown good"));
                    }
                    self.hold.add(reply.good, reply.quantity, reply.expiry);
                    *tons += reply.quantity * self.ctx.catalog.size(reply.good);
                }
                Status::Accepted => {
                    log::debug!(
                        "ship {}: loaded {} units at port {}",
                        self.id,
                        reply.quantity,
                        request.dest
                    );
                    return Ok(());
                }
                Status::Refused | Status::Request => return Ok(()),
            }
        }
    }

    fn next_exchange(&mut self) -> u64 {
        self.exchange += 1;
        self.exchange
    }

    /// Sends `request` and waits for its single reply. `None` means the
    /// exchange was abandoned.
    fn transact(&mut self, request: &Message) -> Result<Option<Message>> {
        self.record()?.open_exchange(request.exchange);
        let outcome = self
            .ctx
            .commerce
            .send_request(request)
            .and_then(|()| self.await_reply(request.exchange));
        self.record()?.close_exchange();
        match outcome {
            Ok(reply) => Ok(Some(reply)),
            Err(err) => self.abandon(err).map(|_| None),
        }
    }

    /// Recoverable commerce failures count as a refusal; anything else
    /// propagates.
    fn abandon(&self, err: Error) -> Result<i64> {
        match err {
            Error::ProtocolTimeout { .. } | Error::ChannelFull(_) => {
                log::warn!("ship {}: exchange abandoned: {err}", self.id);
                Ok(0)
            }
            err => Err(err),
        }
    }

    /// Waits for a reply in slices so a world shutdown still ends the wait,
    /// even when the configured timeout is unbounded.
    ///
    /// When the timeout runs out the exchange is withdrawn, so a port that
    /// reaches the request later leaves it unsettled. If the port claimed it
    /// first its replies are on the way and the wait goes on.
    fn await_reply(&self, exchange: u64) -> Result<Message> {
        let started = Instant::now();
        let mut timeout = self.ctx.config().reply_timeout();
        loop {
            if self.ctx.world.is_shutdown() {
                return Err(Error::Terminated);
            }
            let mut slice = self.pacer.slice();
            if let Some(limit) = timeout {
                let left = limit.saturating_sub(started.elapsed());
                if left.is_zero() {
                    if self.record()?.withdraw_exchange(exchange) {
                        return Err(Error::ProtocolTimeout {
                            agent: self.id,
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    log::debug!("ship {}: exchange {exchange} claimed, waiting on", self.id);
                    timeout = None;
                    continue;
                }
                slice = slice.min(left);
            }
            match self.ctx.commerce.recv_reply(self.id, exchange, Some(slice)) {
                Err(Error::ProtocolTimeout { .. }) => continue,
                other => return other,
            }
        }
    }

    /// Sleeps for `total` with hazard handling between slices.
    fn pause(&self, total: Duration) -> Result<()> {
        let record = self.record()?;
        self.pacer.sleep(total, record.inbox(), || self.drain())
    }

    /// Drains the inbox. Storms yield the downtime to serve; fatal hazards
    /// and shutdown yield an error.
    fn drain(&self) -> Result<Duration> {
        if self.ctx.world.is_shutdown() {
            return Err(Error::Terminated);
        }
        let record = self.record()?;
        let mut downtime = Duration::ZERO;
        while let Some(hazard) = record.inbox().take() {
            match hazard {
                Hazard::Storm => {
                    record.record_storm();
                    log::info!("ship {}: caught in a storm", self.id);
                    downtime += self.pacer.hours(self.ctx.config().storm_duration);
                }
                Hazard::Maelstrom => {
                    record.record_maelstrom();
                    log::info!("ship {}: struck by a maelstrom", self.id);
                    return Err(Error::HazardFault {
                        agent: self.id,
                        hazard: hazard.name(),
                    });
                }
                Hazard::Fault => {
                    return Err(Error::HazardFault {
                        agent: self.id,
                        hazard: hazard.name(),
                    })
                }
                Hazard::Terminate => return Err(Error::Terminated),
                Hazard::Swell => log::debug!("ship {}: ignoring swell", self.id),
            }
        }
        Ok(downtime)
    }

    /// Handles pending hazards, serving any storm downtime on the spot.
    fn checkpoint(&self) -> Result<()> {
        let downtime = self.drain()?;
        if !downtime.is_zero() {
            self.pause(downtime)?;
        }
        Ok(())
    }

    fn teardown(&mut self, exit: Exit) -> Result<()> {
        let lost = self.hold.clear();
        let record = self.record()?;
        record.set_flag(ShipFlag::Moving, false);
        record.set_flag(ShipFlag::AtDock, false);
        record.set_flag(ShipFlag::WithCargo, false);
        if exit != Exit::Terminated {
            record.set_flag(ShipFlag::Dead, true);
        }
        log::info!(
            "ship {}: {:?} after {} voyages, {} batches lost",
            self.id,
            exit,
            self.voyages,
            lost.len()
        );
        Ok(())
    }
}
