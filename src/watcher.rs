//! Device arrival watcher.
//!
//! The arrival callback runs on host threads, possibly several at once,
//! and races with teardown. It therefore does as little as possible: a
//! few cheap eligibility checks, a double-checked look at the
//! terminating flag, then deposit the device and wake the worker. Label
//! reading is deferred to the worker so the callback stays short and
//! drains quickly when the subscription is cancelled.

use crate::discovery::Shared;
use crate::host::{ArrivalHandler, BlockDevice, DeviceNotifier, HostError, Subscription};
use crate::label::MIN_DEVICE_SIZE;
use log::debug;
use std::sync::Arc;

/// Subscribe `shared` to block-device arrivals.
pub(crate) fn attach(
    shared: &Arc<Shared>,
    notifier: &dyn DeviceNotifier,
) -> Result<Box<dyn Subscription>, HostError> {
    let state = Arc::clone(shared);
    let handler: ArrivalHandler = Arc::new(move |device| on_arrival(&state, device));
    notifier.subscribe(handler)
}

fn on_arrival(shared: &Shared, device: Arc<dyn BlockDevice>) {
    if shared.is_terminating() {
        debug!("event=arrival_ignored reason=terminating");
        return;
    }

    if !device.is_leaf() {
        debug!("event=device_skipped reason=not_leaf");
        return;
    }
    let size = device.byte_size();
    if size < MIN_DEVICE_SIZE {
        debug!("event=device_skipped reason=too_small size={size}");
        return;
    }
    let Some(name) = device.bsd_name().filter(|name| !name.is_empty()) else {
        debug!("event=device_skipped reason=no_bsd_name");
        return;
    };

    // Re-check before and after taking the lock: teardown may have won
    // the flag while the checks above ran, and again while we blocked on
    // the mutex. Anything deposited after the transition would leak past
    // the drain.
    if shared.is_terminating() {
        debug!("event=arrival_ignored reason=terminating");
        return;
    }
    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    if shared.is_terminating() {
        debug!("event=arrival_ignored reason=terminating");
        return;
    }
    shared.stats.device_seen();
    debug!("event=device_queued name={name}");
    state.disks.insert(name, device);
    drop(state);

    shared.cv.notify_one();
}
