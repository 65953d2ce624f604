//! Discovery lifecycle: wiring, shared runtime state, teardown.
//!
//! One [`PoolDiscovery`] exists per boot attempt. It gates on the boot
//! arguments, subscribes the device watcher, and dispatches the import
//! worker; teardown can then be driven either by the worker itself (after
//! a successful import) or by an external caller, and runs exactly once.

use crate::aggregate::PoolList;
use crate::bootargs::{boot_target, BootTarget};
use crate::bootdev::BootDeviceHost;
use crate::engine::StorageEngine;
use crate::host::{BlockDevice, BootEnvironment, DeviceNotifier, HostError, Subscription};
use crate::telemetry::{DiscoveryReport, DiscoveryStats};
use crate::{watcher, worker};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// State shared between the arrival callback, the import worker, and
/// whoever calls teardown. One mutex guards the pending device set and
/// the aggregation tree; the terminating flag is read without it and
/// re-checked under it wherever the answer matters.
pub(crate) struct Shared {
    pub(crate) target: BootTarget,
    pub(crate) state: Mutex<DiscoveryState>,
    pub(crate) cv: Condvar,
    pub(crate) terminating: AtomicBool,
    pub(crate) subscription: Mutex<Option<Box<dyn Subscription>>>,
    pub(crate) engine: Arc<dyn StorageEngine>,
    pub(crate) boot_host: Arc<dyn BootDeviceHost>,
    pub(crate) env: Arc<dyn BootEnvironment>,
    pub(crate) stats: DiscoveryStats,
}

pub(crate) struct DiscoveryState {
    /// Devices deposited by the watcher, pending a probe. Keyed by BSD
    /// name so a device is held at most once.
    pub(crate) disks: HashMap<String, Arc<dyn BlockDevice>>,
    pub(crate) pools: PoolList,
}

impl Shared {
    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub(crate) fn set_subscription(&self, subscription: Box<dyn Subscription>) {
        if let Ok(mut slot) = self.subscription.lock() {
            *slot = Some(subscription);
        }
    }

    /// Terminate discovery and free everything it gathered.
    ///
    /// The terminating transition is single-shot: only the caller that
    /// wins it unsubscribes the watcher and clears the state, so the
    /// worker (after an import) and an external caller can both invoke
    /// this without coordination.
    pub(crate) fn teardown(&self) {
        if self
            .terminating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("event=teardown_skipped reason=already_terminating");
            return;
        }
        info!("event=discovery_teardown");

        // Wake the worker so it can observe the flag.
        self.cv.notify_all();

        // Cancel the subscription without holding the state lock: cancel
        // blocks until no arrival callback is in flight, and a callback
        // may be waiting on that lock right now.
        let subscription = match self.subscription.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(mut subscription) = subscription {
            subscription.cancel();
        }

        match self.state.lock() {
            Ok(mut state) => {
                state.disks.clear();
                state.pools = PoolList::new();
            }
            Err(_) => warn!("event=teardown_state_poisoned"),
        }
    }
}

/// Handle for one boot-time discovery attempt.
pub struct PoolDiscovery {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl PoolDiscovery {
    /// Gate on uptime and boot arguments, then start watching for
    /// devices and dispatch the import worker.
    ///
    /// Returns `Ok(None)` when discovery should not run at all: the
    /// system is past early boot, or no pool was asked for.
    pub fn start(
        env: Arc<dyn BootEnvironment>,
        notifier: Arc<dyn DeviceNotifier>,
        engine: Arc<dyn StorageEngine>,
        boot_host: Arc<dyn BootDeviceHost>,
    ) -> Result<Option<PoolDiscovery>, HostError> {
        let Some(target) = boot_target(env.as_ref()) else {
            return Ok(None);
        };

        let shared = Arc::new(Shared {
            target,
            state: Mutex::new(DiscoveryState {
                disks: HashMap::new(),
                pools: PoolList::new(),
            }),
            cv: Condvar::new(),
            terminating: AtomicBool::new(false),
            subscription: Mutex::new(None),
            engine,
            boot_host,
            env,
            stats: DiscoveryStats::default(),
        });

        // Subscribing replays every already-present device through the
        // arrival callback before returning.
        let subscription = watcher::attach(&shared, notifier.as_ref())?;
        shared.set_subscription(subscription);

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("bootpool-import".to_string())
            .spawn(move || worker::run(worker_shared))
            .map_err(HostError::Io)?;

        info!(
            "event=discovery_started pool={} guid={:#x}",
            shared.target.pool_name.as_deref().unwrap_or("-"),
            shared.target.pool_guid
        );
        Ok(Some(PoolDiscovery {
            shared,
            worker: Some(worker),
        }))
    }

    /// The target this attempt is looking for.
    pub fn target(&self) -> &BootTarget {
        &self.shared.target
    }

    pub fn is_terminating(&self) -> bool {
        self.shared.is_terminating()
    }

    /// Counters for this run so far.
    pub fn report(&self) -> DiscoveryReport {
        self.shared.stats.report()
    }

    /// Trigger teardown without waiting for the worker to exit.
    pub fn teardown(&self) {
        self.shared.teardown();
    }

    /// Tear down and wait for the worker to finish.
    pub fn shutdown(mut self) {
        self.shared.teardown();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PoolDiscovery {
    fn drop(&mut self) {
        self.shared.teardown();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RecordingEngine, SimBootHost, SimEnvironment, SimNotifier};
    use std::time::Duration;

    #[test]
    fn start_is_gated_by_boot_arguments() {
        let env = Arc::new(SimEnvironment::new().with_uptime(Duration::from_secs(120)));
        let notifier = Arc::new(SimNotifier::new());
        let engine = Arc::new(RecordingEngine::new());
        let boot_host = Arc::new(SimBootHost::new());
        let started =
            PoolDiscovery::start(env, notifier.clone(), engine, boot_host).unwrap();
        assert!(started.is_none());
        assert!(!notifier.is_subscribed());
    }

    #[test]
    fn teardown_is_single_shot() {
        let env = Arc::new(SimEnvironment::new().with_arg("zfs_boot", "tank"));
        let notifier = Arc::new(SimNotifier::new());
        let engine = Arc::new(RecordingEngine::new());
        let boot_host = Arc::new(SimBootHost::new());
        let discovery = PoolDiscovery::start(env, notifier.clone(), engine, boot_host)
            .unwrap()
            .unwrap();

        assert!(!discovery.is_terminating());
        discovery.teardown();
        assert!(discovery.is_terminating());
        assert_eq!(notifier.cancel_count(), 1);
        // Second call finds the flag already flipped and does nothing.
        discovery.teardown();
        assert_eq!(notifier.cancel_count(), 1);
        discovery.shutdown();
    }
}
