//! Commerce exchange between ships and ports.
//!
//! Two mailbox regions carry the traffic: requests addressed to a port id and
//! replies addressed to a ship id. Each destination owns a fixed array of
//! slots plus a header with a ticket counter and a futex sequence word.
//! Senders claim an empty slot, fill it, stamp it with the next ticket and
//! publish it; the receiver always takes the ready slot with the lowest
//! ticket, so messages to one destination come out in publication order.
//!
//! ```text
//! ship                                port
//!  | -- REQUEST(Sell, good, qty) -->   |  settle against demand
//!  | <-- ACCEPTED(qty) | REFUSED ----  |
//!  | -- REQUEST(Load, capacity) ---->  |  allocate from offers
//!  | <-- LOAD_ACCEPTED(good,qty,exp)*  |
//!  | <-- ACCEPTED(total) | REFUSED --  |
//! ```

use std::mem::size_of;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::core::region::{align_for, Shared};
use crate::core::wait::{futex_wait, futex_wake};
use crate::core::{Error, Region, RegionKey, Result};
use crate::world::{RegionSlot, World};

/// Slots per destination.
pub const MAILBOX_SLOTS: usize = 16;

const SEND_PATIENCE: Duration = Duration::from_millis(500);
const SEND_RETRY: Duration = Duration::from_millis(1);

const SLOT_EMPTY: u32 = 0;
const SLOT_WRITING: u32 = 1;
const SLOT_READY: u32 = 2;
const SLOT_READING: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Request = 0,
    Accepted = 1,
    LoadAccepted = 2,
    Refused = 3,
}

impl TryFrom<u32> for Status {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Status::Request),
            1 => Ok(Status::Accepted),
            2 => Ok(Status::LoadAccepted),
            3 => Ok(Status::Refused),
            _ => Err(Error::Corrupt("unknown message status")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Sell = 0,
    Load = 1,
}

impl TryFrom<u32> for Intent {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Intent::Sell),
            1 => Ok(Intent::Load),
            _ => Err(Error::Corrupt("unknown message intent")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub dest: usize,
    pub sender: usize,
    /// Ship-chosen id echoed in every reply, so late replies to an abandoned
    /// exchange can be told apart.
    pub exchange: u64,
    pub good: usize,
    pub quantity: i64,
    pub expiry: u32,
    pub status: Status,
    pub intent: Intent,
}

impl Message {
    pub fn request(dest: usize, sender: usize, exchange: u64, intent: Intent) -> Self {
        Self {
            dest,
            sender,
            exchange,
            good: 0,
            quantity: 0,
            expiry: 0,
            status: Status::Request,
            intent,
        }
    }

    /// A reply to `self` with sender and destination swapped.
    pub fn reply(&self, status: Status) -> Self {
        Self {
            dest: self.sender,
            sender: self.dest,
            status,
            ..*self
        }
    }
}

#[repr(C, align(64))]
struct MailboxHeader {
    next_ticket: AtomicU64,
    notify_seq: AtomicU32,
    waiters_pending: AtomicU32,
}

unsafe impl Shared for MailboxHeader {}

#[repr(C, align(64))]
struct Slot {
    state: AtomicU32,
    status: AtomicU32,
    intent: AtomicU32,
    expiry: AtomicU32,
    ticket: AtomicU64,
    exchange: AtomicU64,
    sender: AtomicU64,
    good: AtomicU64,
    quantity: AtomicI64,
}

unsafe impl Shared for Slot {}

impl Slot {
    fn store(&self, msg: &Message) {
        self.status.store(msg.status as u32, Ordering::Relaxed);
        self.intent.store(msg.intent as u32, Ordering::Relaxed);
        self.expiry.store(msg.expiry, Ordering::Relaxed);
        self.exchange.store(msg.exchange, Ordering::Relaxed);
        self.sender.store(msg.sender as u64, Ordering::Relaxed);
        self.good.store(msg.good as u64, Ordering::Relaxed);
        self.quantity.store(msg.quantity, Ordering::Relaxed);
    }

    fn load(&self, dest: usize) -> Result<Message> {
        Ok(Message {
            dest,
            sender: self.sender.load(Ordering::Relaxed) as usize,
            exchange: self.exchange.load(Ordering::Relaxed),
            good: self.good.load(Ordering::Relaxed) as usize,
            quantity: self.quantity.load(Ordering::Relaxed),
            expiry: self.expiry.load(Ordering::Relaxed),
            status: Status::try_from(self.status.load(Ordering::Relaxed))?,
            intent: Intent::try_from(self.intent.load(Ordering::Relaxed))?,
        })
    }
}

/// Many-writer, one-reader-per-destination message slots in one region.
pub struct Mailbox {
    _region: Region,
    headers: *const MailboxHeader,
    slots: *const Slot,
    destinations: usize,
}

// SAFETY: both pointers target the mapping owned by `_region`; every field is atomic.
unsafe impl Send for Mailbox {}
unsafe impl Sync for Mailbox {}

fn slots_offset(destinations: usize) -> usize {
    align_for::<Slot>(destinations * size_of::<MailboxHeader>())
}

impl Mailbox {
    pub fn create(root: &std::path::Path, key: RegionKey, destinations: usize) -> Result<Self> {
        let size = slots_offset(destinations) + destinations * MAILBOX_SLOTS * size_of::<Slot>();
        let region = Region::create(root, key, size)?;
        Self::from_region(region, destinations)
    }

    pub fn attach(root: &std::path::Path, key: RegionKey, destinations: usize) -> Result<Self> {
        let region = Region::attach(root, key)?;
        Self::from_region(region, destinations)
    }

    fn from_region(region: Region, destinations: usize) -> Result<Self> {
        let headers = region.view::<MailboxHeader>(0, destinations)?.as_ptr();
        let slots = region
            .view::<Slot>(slots_offset(destinations), destinations * MAILBOX_SLOTS)?
            .as_ptr();
        Ok(Self {
            _region: region,
            headers,
            slots,
            destinations,
        })
    }

    fn header(&self, dest: usize) -> Result<&MailboxHeader> {
        if dest >= self.destinations {
            return Err(Error::InvalidArgument(format!("no mailbox {dest}")));
        }
        Ok(unsafe { &*self.headers.add(dest) })
    }

    fn slots(&self, dest: usize) -> &[Slot] {
        unsafe {
            std::slice::from_raw_parts(self.slots.add(dest * MAILBOX_SLOTS), MAILBOX_SLOTS)
        }
    }

    /// Publishes `msg` to `msg.dest`. Retries while every slot is taken and
    /// gives up with [`Error::ChannelFull`] after a short patience window.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let header = self.header(msg.dest)?;
        let deadline = Instant::now() + SEND_PATIENCE;
        loop {
            for slot in self.slots(msg.dest) {
                if slot
                    .state
                    .compare_exchange(SLOT_EMPTY, SLOT_WRITING, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                slot.store(msg);
                let ticket = header.next_ticket.fetch_add(1, Ordering::AcqRel);
                slot.ticket.store(ticket, Ordering::Relaxed);
                slot.state.store(SLOT_READY, Ordering::Release);
                header.notify_seq.fetch_add(1, Ordering::Release);
                if header.waiters_pending.load(Ordering::SeqCst) > 0 {
                    futex_wake(&header.notify_seq)?;
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::ChannelFull(msg.dest));
            }
            std::thread::sleep(SEND_RETRY);
        }
    }

    /// Takes the oldest ready message without blocking.
    pub fn try_recv(&self, dest: usize) -> Result<Option<Message>> {
        self.header(dest)?;
        loop {
            let oldest = self
                .slots(dest)
                .iter()
                .filter(|slot| slot.state.load(Ordering::Acquire) == SLOT_READY)
                .min_by_key(|slot| slot.ticket.load(Ordering::Relaxed));
            let Some(slot) = oldest else {
                return Ok(None);
            };
            if slot
                .state
                .compare_exchange(SLOT_READY, SLOT_READING, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let msg = slot.load(dest);
            slot.state.store(SLOT_EMPTY, Ordering::Release);
            return msg.map(Some);
        }
    }

    /// Waits up to `timeout` (forever when `None`) for a message to `dest`.
    pub fn recv(&self, dest: usize, timeout: Option<Duration>) -> Result<Option<Message>> {
        let header = self.header(dest)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(msg) = self.try_recv(dest)? {
                return Ok(Some(msg));
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            header.waiters_pending.fetch_add(1, Ordering::SeqCst);
            let seq = header.notify_seq.load(Ordering::Acquire);
            let ready = self
                .slots(dest)
                .iter()
                .any(|slot| slot.state.load(Ordering::Acquire) == SLOT_READY);
            let res = if ready {
                Ok(())
            } else {
                futex_wait(&header.notify_seq, seq, remaining)
            };
            header.waiters_pending.fetch_sub(1, Ordering::SeqCst);
            res?;
        }
    }
}

/// Both mailboxes of the world.
pub struct Commerce {
    requests: Mailbox,
    replies: Mailbox,
}

impl Commerce {
    pub fn create(world: &World) -> Result<Self> {
        Ok(Self {
            requests: Mailbox::create(
                world.root(),
                world.region_key(RegionSlot::Requests),
                world.ports(),
            )?,
            replies: Mailbox::create(
                world.root(),
                world.region_key(RegionSlot::Replies),
                world.ships(),
            )?,
        })
    }

    pub fn attach(world: &World) -> Result<Self> {
        Ok(Self {
            requests: Mailbox::attach(
                world.root(),
                world.region_key(RegionSlot::Requests),
                world.ports(),
            )?,
            replies: Mailbox::attach(
                world.root(),
                world.region_key(RegionSlot::Replies),
                world.ships(),
            )?,
        })
    }

    pub fn send_request(&self, msg: &Message) -> Result<()> {
        log::debug!(
            "ship {} -> port {}: {:?} good {} qty {}",
            msg.sender,
            msg.dest,
            msg.intent,
            msg.good,
            msg.quantity
        );
        self.requests.send(msg)
    }

    pub fn recv_request(&self, port: usize, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.requests.recv(port, timeout)
    }

    pub fn send_reply(&self, msg: &Message) -> Result<()> {
        self.replies.send(msg)
    }

    /// Waits for the next reply belonging to `exchange`. Replies left over from
    /// earlier, abandoned exchanges are dropped. Running out of `timeout`
    /// yields [`Error::ProtocolTimeout`].
    pub fn recv_reply(&self, ship: usize, exchange: u64, timeout: Option<Duration>) -> Result<Message> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.replies.recv(ship, remaining)? {
                Some(msg) if msg.exchange == exchange => return Ok(msg),
                Some(stale) => {
                    log::debug!(
                        "ship {ship}: dropping stale reply for exchange {}",
                        stale.exchange
                    );
                }
                None => {
                    return Err(Error::ProtocolTimeout {
                        agent: ship,
                        waited_ms: started.elapsed().as_millis() as u64,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use std::sync::Arc;

    fn commerce(dir: &std::path::Path, key: u32) -> (World, Commerce) {
        let config = WorldConfig {
            ports: 2,
            ships: 2,
            ..WorldConfig::default()
        };
        let world = World::create(dir, RegionKey(key), &config).expect("world");
        let commerce = Commerce::create(&world).expect("commerce");
        (world, commerce)
    }

    #[test]
    fn messages_come_out_in_send_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_world, commerce) = commerce(dir.path(), 500);
        for qty in 1..=5 {
            let mut msg = Message::request(1, 0, 7, Intent::Sell);
            msg.quantity = qty;
            commerce.send_request(&msg).unwrap();
        }
        let got: Vec<i64> = (0..5)
            .map(|_| commerce.recv_request(1, Some(Duration::ZERO)).unwrap().unwrap().quantity)
            .collect();
        assert_eq!(got, vec![1, 2, 3, 4, 5]);
        assert!(commerce.recv_request(1, Some(Duration::ZERO)).unwrap().is_none());
        assert!(commerce.recv_request(0, Some(Duration::ZERO)).unwrap().is_none());
    }

    #[test]
    fn full_mailbox_reports_channel_full() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_world, commerce) = commerce(dir.path(), 510);
        let msg = Message::request(0, 1, 1, Intent::Load);
        for _ in 0..MAILBOX_SLOTS {
            commerce.send_request(&msg).unwrap();
        }
        assert!(matches!(commerce.send_request(&msg), Err(Error::ChannelFull(0))));
    }

    #[test]
    fn reply_wakes_blocked_ship() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (world, commerce) = commerce(dir.path(), 520);
        let commerce = Arc::new(commerce);
        let port = {
            let commerce = Arc::clone(&commerce);
            std::thread::spawn(move || {
                let req = commerce
                    .recv_request(1, Some(Duration::from_secs(5)))
                    .unwrap()
                    .expect("request");
                let mut reply = req.reply(Status::Accepted);
                reply.quantity = 3;
                commerce.send_reply(&reply).unwrap();
            })
        };
        let mut req = Message::request(1, 0, 42, Intent::Sell);
        req.quantity = 5;
        commerce.send_request(&req).unwrap();
        let reply = commerce
            .recv_reply(0, 42, Some(Duration::from_secs(5)))
            .unwrap();
        port.join().unwrap();
        assert_eq!(reply.status, Status::Accepted);
        assert_eq!((reply.dest, reply.sender, reply.quantity), (0, 1, 3));
        assert_eq!(world.ports(), 2);
    }

    #[test]
    fn stale_replies_are_skipped_and_silence_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_world, commerce) = commerce(dir.path(), 530);
        // Ship 1 asked port 0 twice; only the second exchange is still awaited.
        let stale = Message::request(0, 1, 1, Intent::Sell).reply(Status::Refused);
        let current = Message::request(0, 1, 2, Intent::Sell).reply(Status::Accepted);
        commerce.send_reply(&stale).unwrap();
        commerce.send_reply(&current).unwrap();

        let got = commerce.recv_reply(1, 2, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(got.exchange, 2);
        assert!(matches!(
            commerce.recv_reply(1, 3, Some(Duration::from_millis(10))),
            Err(Error::ProtocolTimeout { agent: 1, .. })
        ));
    }
}
