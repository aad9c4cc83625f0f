//! Current pack state and derived voltage statistics.

use crate::state::{Module, PackSnapshot, VoltageStats};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Holds the module set and publishes an immutable [`PackSnapshot`] on a
/// watch channel whenever the data actually changes.
///
/// Modules are keyed by id, unique, last-write-wins. Statistics are
/// recomputed over every present cell voltage after each update; an update
/// that leaves zero valid voltages keeps the previous statistics rather
/// than zeroing them.
pub struct VoltageAggregator {
    modules: BTreeMap<u8, Module>,
    stats: Option<VoltageStats>,
    tx: watch::Sender<PackSnapshot>,
}

impl VoltageAggregator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PackSnapshot::default());
        Self {
            modules: BTreeMap::new(),
            stats: None,
            tx,
        }
    }

    /// Subscribe to snapshots. The receiver always starts with the
    /// current value.
    pub fn subscribe(&self) -> watch::Receiver<PackSnapshot> {
        self.tx.subscribe()
    }

    /// Merge one decoded module into the set and recompute statistics.
    /// Returns whether anything changed (and so a snapshot was published).
    pub fn apply(&mut self, module: Module) -> bool {
        let module_changed = self.modules.get(&module.id) != Some(&module);
        self.modules.insert(module.id, module);

        let stats_changed = match self.compute_stats() {
            Some((max, min)) => {
                let differs = self
                    .stats
                    .as_ref()
                    .map_or(true, |s| s.max_voltage != max || s.min_voltage != min);
                if differs {
                    self.stats = Some(VoltageStats {
                        max_voltage: max,
                        min_voltage: min,
                        voltage_diff: max - min,
                        last_update: timestamp(),
                    });
                }
                differs
            }
            // No valid voltage anywhere: keep whatever we had.
            None => false,
        };

        let changed = module_changed || stats_changed;
        if changed {
            self.publish();
        }
        changed
    }

    /// Drop all modules and statistics, publishing the empty snapshot.
    pub fn reset(&mut self) {
        self.modules.clear();
        self.stats = None;
        self.publish();
    }

    pub fn snapshot(&self) -> PackSnapshot {
        PackSnapshot {
            modules: self.modules.values().cloned().collect(),
            stats: self.stats.clone(),
        }
    }

    fn compute_stats(&self) -> Option<(f32, f32)> {
        let mut present = self
            .modules
            .values()
            .flat_map(|m| m.cells.iter())
            .filter_map(|c| c.voltage);
        let first = present.next()?;
        let (max, min) = present.fold((first, first), |(max, min), v| {
            (max.max(v), min.min(v))
        });
        Some((max, min))
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot());
    }
}

impl Default for VoltageAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
