//! Expiring cargo lists.
//!
//! A [`CargoHold`] is a ship's private inventory; ports use the same type to
//! remember when the goods they offer go bad. Batches are kept ordered by
//! expiry day so that sales and loads always consume the oldest stock first.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub good: usize,
    pub quantity: i64,
    /// First day on which the batch is no longer usable.
    pub expiry: u32,
}

impl Batch {
    pub fn is_expired(&self, day: u32) -> bool {
        self.expiry <= day
    }
}

#[derive(Debug, Clone, Default)]
pub struct CargoHold {
    batches: Vec<Batch>,
}

impl CargoHold {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a batch after every batch expiring on or before it. Empty or
    /// negative quantities are ignored.
    pub fn add(&mut self, good: usize, quantity: i64, expiry: u32) {
        if quantity <= 0 {
            return;
        }
        let at = self.batches.partition_point(|batch| batch.expiry <= expiry);
        self.batches.insert(
            at,
            Batch {
                good,
                quantity,
                expiry,
            },
        );
    }

    pub fn quantity_of(&self, good: usize) -> i64 {
        self.batches
            .iter()
            .filter(|batch| batch.good == good)
            .map(|batch| batch.quantity)
            .sum()
    }

    /// Quantity of `good` that will still be usable on `day`.
    pub fn usable_on(&self, good: usize, day: u32) -> i64 {
        self.batches
            .iter()
            .filter(|batch| batch.good == good && !batch.is_expired(day))
            .map(|batch| batch.quantity)
            .sum()
    }

    pub fn total(&self) -> i64 {
        self.batches.iter().map(|batch| batch.quantity).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Drops every batch expired as of `day` and returns them.
    pub fn remove_expired(&mut self, day: u32) -> Vec<Batch> {
        // Ordered by expiry, so the expired batches form a prefix.
        let cut = self.batches.partition_point(|batch| batch.is_expired(day));
        self.batches.drain(..cut).collect()
    }

    /// Removes up to `quantity` of `good`, oldest first, returning what was
    /// taken as batches that keep their original expiry.
    pub fn take(&mut self, good: usize, quantity: i64) -> Vec<Batch> {
        let mut remaining = quantity;
        let mut taken = Vec::new();
        let mut i = 0;
        while remaining > 0 && i < self.batches.len() {
            let batch = &mut self.batches[i];
            if batch.good != good {
                i += 1;
                continue;
            }
            let moved = batch.quantity.min(remaining);
            taken.push(Batch {
                good,
                quantity: moved,
                expiry: batch.expiry,
            });
            remaining -= moved;
            batch.quantity -= moved;
            if batch.quantity == 0 {
                self.batches.remove(i);
            } else {
                i += 1;
            }
        }
        taken
    }

    pub fn clear(&mut self) -> Vec<Batch> {
        std::mem::take(&mut self.batches)
    }
}
