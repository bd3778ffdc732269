use std::sync::atomic::Ordering;

use rand::Rng;

use super::{Ledger, Manifest};
use crate::catalog::Catalog;
use crate::core::Result;
use crate::hold::CargoHold;

/// What one generation pass added to a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub offered: Manifest,
    pub demanded: Manifest,
    /// Sum of `quantity * unit size` over everything generated.
    pub weight: i64,
}

impl Ledger {
    /// Spends a weight budget of random offers and demands on `port`.
    ///
    /// Each round draws a good and a quantity. When the draw overshoots the
    /// remaining budget the goods are scanned from the drawn one onwards,
    /// itself included, for a unit size that still fits, then the lightest
    /// good is tried; if nothing fits the pass ends. A cell already
    /// carrying demand only ever receives demand and a cell carrying offers
    /// only ever receives offers; untouched cells pick a side by coin flip,
    /// so the first draw settles the side of a cell for good.
    ///
    /// Offers are also recorded in `expiring` with an expiry of
    /// `day + shelf life`.
    pub fn generate_random_activity<R: Rng>(
        &self,
        port: usize,
        expiring: &mut CargoHold,
        catalog: &Catalog,
        day: u32,
        budget: i64,
        rng: &mut R,
    ) -> Result<Activity> {
        let goods = self.goods();
        let mut activity = Activity {
            offered: Manifest::new(goods),
            demanded: Manifest::new(goods),
            weight: 0,
        };
        let lightest = catalog.min_size_good();
        let lightest_size = catalog.size(lightest);

        let _offers = self.offers.lock_port(port)?;
        let _demand = self.demand.lock_port(port)?;

        let mut remaining = budget;
        while remaining > 0 {
            let mut good = rng.gen_range(0..goods);
            let mut quantity = rng.gen_range(1..=remaining);
            let mut size = catalog.size(good);

            if quantity * size > remaining {
                match fitting_good(catalog, good, remaining) {
                    Some(candidate) => {
                        good = candidate;
                        size = catalog.size(candidate);
                        quantity = rng.gen_range(1..=remaining / size);
                    }
                    None if lightest_size <= remaining => {
                        good = lightest;
                        size = lightest_size;
                        quantity = remaining / size;
                    }
                    None => break,
                }
            }

            let demand = self.demand.cell(port, good)?;
            let offer = self.offers.cell(port, good)?;
            let as_offer = if demand.load(Ordering::Acquire) > 0 {
                false
            } else if offer.load(Ordering::Acquire) > 0 {
                true
            } else {
                rng.gen_bool(0.5)
            };

            if as_offer {
                self.offers.add(port, good, quantity)?;
                expiring.add(good, quantity, day + catalog.life(good));
                catalog.record_generated(good, quantity);
                catalog.record_offer(good, port, quantity);
                activity.offered.add(good, quantity);
            } else {
                self.demand.add(port, good, quantity)?;
                catalog.record_demand(good, port, quantity);
                activity.demanded.add(good, quantity);
            }

            activity.weight += quantity * size;
            remaining -= quantity * size;
        }

        log::debug!(
            "port {port}: generated weight {} of {budget} on day {day}",
            activity.weight
        );
        Ok(activity)
    }
}

/// First good, scanning from `start` and wrapping around, whose unit size
/// fits in `remaining`.
fn fitting_good(catalog: &Catalog, start: usize, remaining: i64) -> Option<usize> {
    let goods = catalog.goods();
    (0..goods)
        .map(|step| (start + step) % goods)
        .find(|&candidate| catalog.size(candidate) <= remaining)
}
