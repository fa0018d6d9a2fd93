//! Load rebalancing for hash bonds
//!
//! Each pass groups buckets by slave, then greedily moves buckets from the
//! most-loaded enabled slave to the least-loaded one while that narrows
//! the gap meaningfully. Afterwards every bucket's byte counter is halved,
//! an exponentially weighted moving average in which history decays below
//! 1% after seven passes.

use super::bond::BondCtx;
use super::port::Port;
use super::tag::Tag;
use std::cmp::Ordering;
use std::fmt::Write;
use tracing::{debug, enabled, info, Level};

/// Gaps below this many bytes per interval are not worth fixing
pub const REBALANCE_MIN_OVERLOAD: u64 = 100_000;

/// A move must lower the load ratio between the two slaves by this much
pub const REBALANCE_MIN_RATIO_GAIN: f64 = 0.1;

/// Load carried by one slave during a rebalancing pass
#[derive(Debug, Clone)]
struct SlaveBalance {
    slave: usize,
    enabled: bool,
    tx_bytes: u64,
    /// Buckets on this slave, ascending by load
    buckets: Vec<usize>,
}

/// Enabled slaves first, then descending load, then slave order
fn compare_balance(a: &SlaveBalance, b: &SlaveBalance) -> Ordering {
    b.enabled
        .cmp(&a.enabled)
        .then(b.tx_bytes.cmp(&a.tx_bytes))
        .then(a.slave.cmp(&b.slave))
}

impl Port {
    /// Runs one rebalancing pass if this port is a hash bond
    pub(crate) fn rebalance(&mut self, ctx: &mut BondCtx) {
        let Some(table) = self.bond_table.as_ref() else {
            return;
        };

        let mut bals: Vec<SlaveBalance> = self
            .slaves
            .iter()
            .enumerate()
            .map(|(i, s)| SlaveBalance {
                slave: i,
                enabled: s.enabled,
                tx_bytes: 0,
                buckets: Vec::new(),
            })
            .collect();
        for (bucket, entry) in table.iter().enumerate() {
            if let Some(b) = entry.slave.and_then(|i| bals.get_mut(i)) {
                b.tx_bytes += entry.tx_bytes;
                b.buckets.push(bucket);
            }
        }
        for b in bals.iter_mut() {
            b.buckets.sort_by_key(|&h| (table[h].tx_bytes, h));
        }
        bals.sort_by(compare_balance);
        self.log_balance(&bals);

        // Disabled slaves sorted to the back; forget them.
        bals.retain(|b| b.enabled);

        if bals.len() >= 2 {
            self.shift_load(&mut bals, ctx);
        }

        self.decay_buckets(ctx);
    }

    fn shift_load(&mut self, bals: &mut [SlaveBalance], ctx: &mut BondCtx) {
        let to = bals.len() - 1;
        let mut from = 0;
        while from < to {
            let overload = bals[from].tx_bytes.saturating_sub(bals[to].tx_bytes);
            if overload < bals[to].tx_bytes >> 5 || overload < REBALANCE_MIN_OVERLOAD {
                // Every slave from here on is within ~3% (or ~1 Mbps) of
                // the least loaded one.
                break;
            }
            if bals[from].buckets.len() == 1 {
                // A single bucket cannot be split.
                from += 1;
                continue;
            }

            match self.pick_bucket(&bals[from], &bals[to]) {
                Some(pos) => {
                    let bucket = bals[from].buckets.remove(pos);
                    let delta = self.bond_table.as_ref().map_or(0, |t| t[bucket].tx_bytes);
                    info!(
                        bond = %self.name,
                        "Shift {}kB of load (with hash {}) from {} to {} (now carrying {}kB and {}kB load, respectively)",
                        delta / 1024,
                        bucket,
                        self.slaves[bals[from].slave].name,
                        self.slaves[bals[to].slave].name,
                        (bals[from].tx_bytes - delta) / 1024,
                        (bals[to].tx_bytes + delta) / 1024
                    );
                    bals[from].tx_bytes -= delta;
                    bals[to].tx_bytes += delta;
                    // The bucket is not added to `to`: it will not move
                    // again during this pass.
                    self.migrate_bucket(bucket, bals[to].slave, ctx);
                    bals.sort_by(compare_balance);
                }
                None => from += 1,
            }
        }
    }

    /// Position in `from.buckets` of the smallest bucket worth moving
    fn pick_bucket(&self, from: &SlaveBalance, to: &SlaveBalance) -> Option<usize> {
        let table = self.bond_table.as_ref()?;
        from.buckets.iter().position(|&h| {
            let delta = table[h].tx_bytes;
            if delta == 0 || from.tx_bytes - delta == 0 {
                return false;
            }
            if to.tx_bytes == 0 {
                return true;
            }

            let old_ratio = from.tx_bytes as f64 / to.tx_bytes as f64;
            let mut new_ratio = (from.tx_bytes - delta) as f64 / (to.tx_bytes + delta) as f64;
            if new_ratio == 0.0 {
                return false;
            }
            if new_ratio < 1.0 {
                new_ratio = 1.0 / new_ratio;
            }
            old_ratio - new_ratio > REBALANCE_MIN_RATIO_GAIN
        })
    }

    fn decay_buckets(&mut self, ctx: &mut BondCtx) {
        let mut released: Vec<Tag> = Vec::new();
        if let Some(table) = self.bond_table.as_mut() {
            for entry in table.iter_mut() {
                entry.tx_bytes /= 2;
                if entry.tx_bytes == 0 && entry.slave.is_some() {
                    entry.slave = None;
                    released.push(entry.tag);
                    entry.tag = Tag::random();
                }
            }
        }
        for tag in released {
            ctx.revalidate(tag);
        }
    }

    fn log_balance(&self, bals: &[SlaveBalance]) {
        if !enabled!(Level::DEBUG) {
            return;
        }
        let Some(table) = self.bond_table.as_ref() else {
            return;
        };
        let mut s = String::new();
        for (i, b) in bals.iter().enumerate() {
            if i > 0 {
                s.push(',');
            }
            let _ = write!(s, " {} {}kB", self.slaves[b.slave].name, b.tx_bytes / 1024);
            if !b.enabled {
                s.push_str(" (disabled)");
            }
            if !b.buckets.is_empty() {
                s.push_str(" (");
                for (j, &h) in b.buckets.iter().enumerate() {
                    if j > 0 {
                        s.push_str(" + ");
                    }
                    let _ = write!(s, "h{}: {}kB", h, table[h].tx_bytes / 1024);
                }
                s.push(')');
            }
        }
        debug!("bond {}:{}", self.name, s);
    }
}
