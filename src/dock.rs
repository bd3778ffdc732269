//! Per-port dock resource.
//!
//! A counting semaphore in shared memory, initialised to the port's dock
//! capacity. Ships hold one unit for the whole dock/trade/undock sequence;
//! while they do, no more than `capacity` ships mutate that port's side of
//! the ledger. The wait is sliced so the waiting agent can run its hazard
//! checkpoint and abandon the wait.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::region::Shared;
use crate::core::wait::{futex_wait, futex_wake_n};
use crate::core::Result;
use crate::records::PortTable;

#[repr(C)]
pub struct DockSemaphore {
    /// Free units; futex word.
    available: AtomicU32,
    capacity: AtomicU32,
    waiting: AtomicU32,
    _pad: AtomicU32,
}

unsafe impl Shared for DockSemaphore {}

impl DockSemaphore {
    pub fn init(&self, capacity: u32) {
        self.capacity.store(capacity, Ordering::Relaxed);
        self.waiting.store(0, Ordering::Relaxed);
        self.available.store(capacity, Ordering::Release);
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire)
    }

    pub fn occupied(&self) -> u32 {
        self.capacity().saturating_sub(self.available())
    }

    pub fn waiting(&self) -> u32 {
        self.waiting.load(Ordering::Relaxed)
    }

    pub fn try_acquire(&self) -> bool {
        let mut current = self.available.load(Ordering::Acquire);
        while current > 0 {
            match self.available.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Blocks until a unit is free. Between wait slices `checkpoint` runs; an
    /// error from it abandons the wait without taking a unit.
    pub fn acquire_with<F>(&self, slice: Duration, mut checkpoint: F) -> Result<()>
    where
        F: FnMut() -> Result<()>,
    {
        if self.try_acquire() {
            return Ok(());
        }
        self.waiting.fetch_add(1, Ordering::Relaxed);
        let outcome = loop {
            if self.try_acquire() {
                break Ok(());
            }
            if let Err(err) = futex_wait(&self.available, 0, Some(slice)) {
                break Err(err);
            }
            if let Err(err) = checkpoint() {
                break Err(err);
            }
        };
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        outcome
    }

    pub fn release(&self) -> Result<()> {
        self.available.fetch_add(1, Ordering::AcqRel);
        futex_wake_n(&self.available, 1)
    }
}

/// One held dock unit. Dropping the guard releases it, so every exit path of
/// a dock visit (including hazard teardown) gives the dock back.
pub struct DockGuard {
    ports: Arc<PortTable>,
    port: usize,
}

impl DockGuard {
    pub fn acquire<F>(ports: Arc<PortTable>, port: usize, slice: Duration, checkpoint: F) -> Result<Self>
    where
        F: FnMut() -> Result<()>,
    {
        ports.get(port)?.dock().acquire_with(slice, checkpoint)?;
        Ok(Self { ports, port })
    }

    pub fn port(&self) -> usize {
        self.port
    }
}

impl Drop for DockGuard {
    fn drop(&mut self) {
        match self.ports.get(self.port) {
            Ok(record) => {
                if let Err(err) = record.dock().release() {
                    log::error!("port {}: dock release wake failed: {err}", self.port);
                }
            }
            Err(err) => log::error!("port {}: dock release failed: {err}", self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;

    fn semaphore(capacity: u32) -> DockSemaphore {
        let sem = DockSemaphore {
            available: AtomicU32::new(0),
            capacity: AtomicU32::new(0),
            waiting: AtomicU32::new(0),
            _pad: AtomicU32::new(0),
        };
        sem.init(capacity);
        sem
    }

    #[test]
    fn capacity_bounds_holders() {
        let sem = semaphore(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        assert_eq!(sem.occupied(), 2);
        sem.release().unwrap();
        assert!(sem.try_acquire());
    }

    #[test]
    fn checkpoint_error_abandons_wait() {
        let sem = semaphore(1);
        assert!(sem.try_acquire());
        let mut calls = 0;
        let result = sem.acquire_with(Duration::from_millis(1), || {
            calls += 1;
            if calls == 3 {
                Err(Error::Terminated)
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(Error::Terminated)));
        assert_eq!(sem.available(), 0);
        assert_eq!(sem.waiting(), 0);
    }

    #[test]
    fn release_wakes_a_waiter() {
        let sem = Arc::new(semaphore(1));
        assert!(sem.try_acquire());
        let waiter = {
            let sem = Arc::clone(&sem);
            std::thread::spawn(move || sem.acquire_with(Duration::from_secs(5), || Ok(())))
        };
        std::thread::sleep(Duration::from_millis(20));
        sem.release().unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(sem.available(), 0);
    }
}
