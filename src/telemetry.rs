//! Counters describing one discovery run.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters bumped by the watcher and the import worker.
/// Cheap enough to update from the arrival callback.
#[derive(Debug, Default)]
pub struct DiscoveryStats {
    devices_seen: AtomicU64,
    devices_probed: AtomicU64,
    labels_found: AtomicU64,
    configs_added: AtomicU64,
    configs_dropped: AtomicU64,
    import_attempts: AtomicU64,
    import_failures: AtomicU64,
}

impl DiscoveryStats {
    pub(crate) fn device_seen(&self) {
        self.devices_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn device_probed(&self) {
        self.devices_probed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn labels_found(&self, count: u8) {
        self.labels_found.fetch_add(u64::from(count), Ordering::Relaxed);
    }

    pub(crate) fn config_added(&self) {
        self.configs_added.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn config_dropped(&self) {
        self.configs_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn import_attempted(&self) {
        self.import_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn import_failed(&self) {
        self.import_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> DiscoveryReport {
        DiscoveryReport {
            devices_seen: self.devices_seen.load(Ordering::Relaxed),
            devices_probed: self.devices_probed.load(Ordering::Relaxed),
            labels_found: self.labels_found.load(Ordering::Relaxed),
            configs_added: self.configs_added.load(Ordering::Relaxed),
            configs_dropped: self.configs_dropped.load(Ordering::Relaxed),
            import_attempts: self.import_attempts.load(Ordering::Relaxed),
            import_failures: self.import_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`DiscoveryStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub devices_seen: u64,
    pub devices_probed: u64,
    pub labels_found: u64,
    pub configs_added: u64,
    pub configs_dropped: u64,
    pub import_attempts: u64,
    pub import_failures: u64,
}
