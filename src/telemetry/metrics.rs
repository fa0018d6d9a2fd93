//! Metrics collection for forwarding decisions.
//!
//! Provides thread-safe counters for tracking admission, fan-out and
//! bonding events at both the bridge and the per-slave level.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-slave transmit statistics, fed by flow accounting.
#[derive(Debug, Default)]
pub struct SlaveStats {
    /// Number of accounted flow updates sent out this slave.
    pub tx_flows: Counter,
    /// Number of bytes sent out this slave.
    pub tx_bytes: Counter,
}

impl SlaveStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records bytes accounted to this slave.
    pub fn record_tx(&self, bytes: u64) {
        self.tx_flows.inc();
        self.tx_bytes.add(bytes);
    }
}

/// Metrics registry for one bridge.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Per-slave statistics.
    slaves: RwLock<HashMap<String, SlaveStats>>,
    /// Drops keyed by reason label.
    drops: RwLock<BTreeMap<&'static str, Counter>>,

    // Admission metrics
    /// Number of flows that passed the admissibility filter.
    pub flows_admitted: Counter,
    /// Number of flows refused by the admissibility filter.
    pub flows_dropped: Counter,
    /// Number of cached flows ejected during revalidation.
    pub flows_ejected: Counter,

    // Fan-out metrics
    /// Number of destinations produced by fan-out composition.
    pub destinations_composed: Counter,

    // Bonding metrics
    /// Number of hash buckets moved between slaves.
    pub bucket_migrations: Counter,
    /// Number of slaves enabled.
    pub slave_enables: Counter,
    /// Number of slaves disabled.
    pub slave_disables: Counter,
    /// Number of active-slave changes.
    pub active_slave_changes: Counter,
    /// Number of learning packets handed to the sender.
    pub learning_packets_sent: Counter,
    /// Number of learning packets the sender failed to send.
    pub learning_packet_errors: Counter,

    // Control-plane metrics
    /// Number of change tags reported for revalidation.
    pub revalidations: Counter,
    /// Number of source MACs that moved or were learned.
    pub macs_learned: Counter,

    /// Current number of learned MACs.
    pub mac_table_size: AtomicU64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slave for statistics tracking.
    pub fn register_slave(&self, name: &str) {
        write(&self.slaves).entry(name.to_string()).or_default();
    }

    /// Stops tracking a removed slave.
    pub fn unregister_slave(&self, name: &str) {
        write(&self.slaves).remove(name);
    }

    /// Records bytes accounted to a slave.
    pub fn record_tx(&self, slave: &str, bytes: u64) {
        if let Some(stats) = read(&self.slaves).get(slave) {
            stats.record_tx(bytes);
        }
    }

    /// Records a refused flow under its reason label.
    pub fn record_drop(&self, reason: &'static str) {
        self.flows_dropped.inc();
        if let Some(counter) = read(&self.drops).get(reason) {
            counter.inc();
            return;
        }
        write(&self.drops).entry(reason).or_default().inc();
    }

    /// Drops recorded under `reason`.
    pub fn drops(&self, reason: &str) -> u64 {
        read(&self.drops).get(reason).map_or(0, |c| c.get())
    }

    /// Transmitted bytes recorded for `slave`.
    pub fn slave_tx_bytes(&self, slave: &str) -> u64 {
        read(&self.slaves).get(slave).map_or(0, |s| s.tx_bytes.get())
    }

    /// Updates the MAC table size gauge.
    pub fn set_mac_table_size(&self, size: usize) {
        self.mac_table_size.store(size as u64, Ordering::Relaxed);
    }

    /// Exports all metrics as key-value pairs.
    ///
    /// This format is designed to be easily convertible to Prometheus format
    /// in the future.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("flows_admitted".into(), self.flows_admitted.get()),
            ("flows_dropped".into(), self.flows_dropped.get()),
            ("flows_ejected".into(), self.flows_ejected.get()),
            ("destinations_composed".into(), self.destinations_composed.get()),
            ("bucket_migrations".into(), self.bucket_migrations.get()),
            ("slave_enables".into(), self.slave_enables.get()),
            ("slave_disables".into(), self.slave_disables.get()),
            ("active_slave_changes".into(), self.active_slave_changes.get()),
            ("learning_packets_sent".into(), self.learning_packets_sent.get()),
            ("learning_packet_errors".into(), self.learning_packet_errors.get()),
            ("revalidations".into(), self.revalidations.get()),
            ("macs_learned".into(), self.macs_learned.get()),
            (
                "mac_table_size".into(),
                self.mac_table_size.load(Ordering::Relaxed),
            ),
        ];

        for (reason, counter) in read(&self.drops).iter() {
            result.push((format!("drops_{}", reason), counter.get()));
        }

        // Per-slave metrics
        let slaves = read(&self.slaves);
        let mut names: Vec<&String> = slaves.keys().collect();
        names.sort();
        for name in names {
            let stats = &slaves[name];
            result.extend([
                (format!("{}_tx_flows", name), stats.tx_flows.get()),
                (format!("{}_tx_bytes", name), stats.tx_bytes.get()),
            ]);
        }

        result
    }
}
